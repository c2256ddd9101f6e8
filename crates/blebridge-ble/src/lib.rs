//! BLE gateway core
//!
//! Schedules a hardware-limited number of BLE connections and runs device
//! protocols over them on behalf of a message bus bridge.
//!
//! ## Architecture
//!
//! - [`config`] - Typed gateway and device configuration
//! - [`error`] - Transport fault classification and gateway errors
//! - [`protocol`] - GATT identifiers and short UUID expansion
//! - [`transport`] - The platform abstraction the pool drives
//! - [`platform`] - `btleplug` implementation of the transport
//! - [`broker`] - Notification fan-out with one-shot and stream subscribers
//! - [`pool`] - LRU admission control behind a single connect lock
//! - [`link`] - One device connection with send/receive retry policy
//! - [`device`] - Device adapters, currently the Tuya Fingerbot
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use blebridge_ble::{
//!     BtleplugTransport, ConnectionPool, DeviceAdapter, FingerbotConfig, GatewayConfig,
//!     TuyaFingerBot,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(BtleplugTransport::new().await?);
//! let pool = ConnectionPool::new(transport, GatewayConfig::default());
//!
//! let config = FingerbotConfig::new(
//!     "DC:23:4D:0A:11:22",
//!     "bf0123456789abcd",
//!     "tuya0123456789ab",
//!     "a1b2c3d4e5f6",
//! );
//! let mut fingerbot = TuyaFingerBot::from_config(&pool, config)?;
//! fingerbot.open().await?;
//! fingerbot.press().await?;
//! fingerbot.close().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod device;
pub mod error;
pub mod link;
pub mod platform;
pub mod pool;
pub mod protocol;
pub mod transport;

// Public API exports
pub use broker::{Notification, NotificationBroker, OnceSubscription, Registry, Subscription};
pub use config::{DeviceConfig, FingerbotConfig, GatewayConfig};
pub use device::{build_device, DeviceAdapter, DeviceEvent, FingerbotDp, TuyaFingerBot};
pub use error::{GatewayError, GatewayResult, TransportFault};
pub use link::{ConnectionState, Link, LinkEvent, NotificationStream};
pub use platform::BtleplugTransport;
pub use pool::ConnectionPool;
pub use protocol::{
    expand_uuid, short_uuid, BLUETOOTH_BASE_UUID, FINGERBOT_NOTIFY_CHARACTERISTIC_UUID,
    FINGERBOT_WRITE_CHARACTERISTIC_UUID,
};
pub use transport::{BleTransport, LinkSink};

// Re-export the protocol engine for adapters built outside this crate
pub use blebridge_core;
