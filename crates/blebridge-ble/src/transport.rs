//! Platform transport abstraction
//!
//! The pool and links only ever talk to a [`BleTransport`]. Implementations
//! report inbound notifications and remote disconnects through the
//! [`LinkSink`] handed to them on connect; the sink queues into the link's
//! broker and never runs subscriber code on the caller's thread.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::TransportFault;
use crate::link::LinkShared;

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// Primitive BLE operations required from the platform layer
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Connect to `address`; the sink stays valid until disconnect
    async fn connect(&self, address: &str, sink: LinkSink) -> Result<(), TransportFault>;

    async fn disconnect(&self, address: &str) -> Result<(), TransportFault>;

    async fn write_characteristic(
        &self,
        address: &str,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportFault>;

    /// Enable notifications; values arrive through the connect sink
    async fn subscribe_notify(&self, address: &str, characteristic: Uuid)
        -> Result<(), TransportFault>;

    async fn unsubscribe_notify(
        &self,
        address: &str,
        characteristic: Uuid,
    ) -> Result<(), TransportFault>;

    /// Scan until `address` is seen or `timeout` elapses
    async fn scan_for_address(&self, address: &str, timeout: Duration)
        -> Result<bool, TransportFault>;
}

// ----------------------------------------------------------------------------
// Link Sink
// ----------------------------------------------------------------------------

/// Callback handle from a transport back into one link
#[derive(Clone)]
pub struct LinkSink {
    link: Weak<LinkShared>,
}

impl LinkSink {
    pub(crate) fn new(link: &Arc<LinkShared>) -> Self {
        Self {
            link: Arc::downgrade(link),
        }
    }

    /// Queue a notification value; returns false once the link is gone
    pub fn deliver(&self, characteristic: Uuid, value: Vec<u8>) -> bool {
        match self.link.upgrade() {
            Some(link) => {
                link.deliver(characteristic, value);
                true
            }
            None => false,
        }
    }

    /// Report that the peer dropped the connection
    pub fn disconnected(&self) {
        if let Some(link) = self.link.upgrade() {
            link.mark_disconnected();
        }
    }

    /// Whether the link behind this sink has been dropped
    pub fn is_closed(&self) -> bool {
        self.link.strong_count() == 0
    }
}

impl std::fmt::Debug for LinkSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.link.upgrade() {
            Some(link) => write!(f, "LinkSink({})", link.address()),
            None => write!(f, "LinkSink(closed)"),
        }
    }
}
