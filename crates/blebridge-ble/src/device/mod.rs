//! Device adapters
//!
//! Each device kind implements [`DeviceAdapter`] on top of a [`Link`](crate::Link).
//! The bus bridge only sees the capability set: open, close, telemetry and
//! control messages. Adding a device kind adds a [`DeviceConfig`] variant and
//! an adapter, nothing in the pool or link.

use std::sync::Arc;

use async_trait::async_trait;
use blebridge_core::DataPoint;
use tokio::sync::broadcast;

use crate::config::DeviceConfig;
use crate::error::GatewayResult;
use crate::pool::ConnectionPool;

mod fingerbot;

pub use fingerbot::{press_points, FingerbotDp, TuyaFingerBot};

// ----------------------------------------------------------------------------
// Device Events
// ----------------------------------------------------------------------------

/// Telemetry published by an adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected,
    Disconnected,
    /// Session key negotiated on the current connection
    SessionUpdated,
    Paired,
    /// Device reported new attribute values
    StateChanged(Vec<DataPoint>),
}

// ----------------------------------------------------------------------------
// Adapter Capability
// ----------------------------------------------------------------------------

/// Capability interface every device kind provides
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Stable identifier used for bus topics
    fn identifier(&self) -> &str;

    /// Start background listeners; does not force a connection
    async fn open(&mut self) -> GatewayResult<()>;

    /// Stop listeners and disconnect
    async fn close(&mut self);

    /// Subscribe to device telemetry
    fn bind_telemetry(&self) -> broadcast::Receiver<DeviceEvent>;

    /// Handle a control message; `topic` is already split into parts
    async fn handle_incoming_control(&self, topic: &[&str], data: Option<&str>)
        -> GatewayResult<()>;
}

/// Build the adapter for one configured device
pub fn build_device(
    pool: &Arc<ConnectionPool>,
    config: &DeviceConfig,
) -> GatewayResult<Box<dyn DeviceAdapter>> {
    match config {
        DeviceConfig::TuyaFingerbot(settings) => Ok(Box::new(TuyaFingerBot::from_config(
            pool,
            settings.clone(),
        )?)),
    }
}
