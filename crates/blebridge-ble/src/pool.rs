//! Connection pool
//!
//! Bounds the number of connected links and serializes every connect and
//! disconnect behind one lock, since the adapter cannot run two at once.
//! Links are kept in recency order, least recently used at the front. Writes
//! and notification setup on connected links do not take the lock.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult, TransportFault};
use crate::link::{ConnectionState, Link, LinkShared};
use crate::transport::{BleTransport, LinkSink};

// ----------------------------------------------------------------------------
// Pool State
// ----------------------------------------------------------------------------

#[derive(Default)]
struct PoolState {
    recency: VecDeque<Arc<LinkShared>>,
}

impl PoolState {
    /// Move `link` to the most recently used position
    ///
    /// Links that dropped their connection since the last admission leave
    /// the pool here.
    fn touch(&mut self, link: &Arc<LinkShared>) {
        self.recency.retain(|entry| {
            !Arc::ptr_eq(entry, link) && entry.state() != ConnectionState::Disconnected
        });
        self.recency.push_back(Arc::clone(link));
    }

    fn remove(&mut self, link: &Arc<LinkShared>) {
        self.recency.retain(|entry| !Arc::ptr_eq(entry, link));
    }
}

// ----------------------------------------------------------------------------
// Connection Pool
// ----------------------------------------------------------------------------

/// Admission control for a hardware-limited number of connections
pub struct ConnectionPool {
    transport: Arc<dyn BleTransport>,
    config: GatewayConfig,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    /// Create a pool over `transport`
    pub fn new(transport: Arc<dyn BleTransport>, config: GatewayConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            state: Mutex::new(PoolState::default()),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn BleTransport> {
        &self.transport
    }

    /// Admit `link` and connect it if needed
    pub async fn connect(&self, link: &Link) -> GatewayResult<()> {
        self.connect_shared(link.shared()).await
    }

    /// Disconnect `link` and remove it from the pool
    pub async fn disconnect(&self, link: &Link) {
        self.disconnect_shared(link.shared()).await;
    }

    /// Disconnect every pooled link
    pub async fn disconnect_all(&self) {
        let mut state = self.state.lock().await;
        let links: Vec<_> = state.recency.drain(..).collect();
        for link in &links {
            self.disconnect_locked(link).await;
        }
        info!("Disconnected all {} pooled links", links.len());
    }

    /// Pooled links currently connected
    pub async fn connected_count(&self) -> usize {
        let state = self.state.lock().await;
        state.recency.iter().filter(|link| link.is_connected()).count()
    }

    /// Pooled addresses, least recently used first
    pub async fn addresses(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .recency
            .iter()
            .map(|link| link.address().to_string())
            .collect()
    }

    // ------------------------------------------------------------------------
    // Connect / Disconnect
    // ------------------------------------------------------------------------

    pub(crate) async fn connect_shared(&self, link: &Arc<LinkShared>) -> GatewayResult<()> {
        let attempts = self.config.connect_attempts;
        let mut state = self.state.lock().await;

        for attempt in 1..=attempts {
            state.touch(link);
            while state.recency.len() > self.config.pool_capacity {
                let Some(lru) = state.recency.pop_front() else {
                    break;
                };
                info!(
                    "Pool at capacity {}, evicting least recently used link {}",
                    self.config.pool_capacity,
                    lru.address()
                );
                self.disconnect_locked(&lru).await;
            }

            if link.is_connected() {
                return Ok(());
            }

            link.set_state(ConnectionState::Connecting);
            debug!(
                "Connecting to {} (attempt {}/{})",
                link.address(),
                attempt,
                attempts
            );

            match self
                .transport
                .connect(link.address(), LinkSink::new(link))
                .await
            {
                Ok(()) => {
                    link.mark_connected();
                    self.rearm(link).await;
                    return Ok(());
                }
                Err(TransportFault::LocalAbort(reason)) => {
                    link.set_state(ConnectionState::Disconnected);
                    warn!(
                        "Connect to {} aborted locally ({}), attempt {}/{}",
                        link.address(),
                        reason,
                        attempt,
                        attempts
                    );
                }
                Err(TransportFault::DeviceNotFound { .. }) => {
                    link.set_state(ConnectionState::Disconnected);
                    warn!(
                        "Device {} not found, rescanning (attempt {}/{})",
                        link.address(),
                        attempt,
                        attempts
                    );
                    self.rescan(link.address()).await;
                }
                Err(fault) => {
                    link.set_state(ConnectionState::Disconnected);
                    error!("Connect to {} failed: {}", link.address(), fault);
                    return Err(fault.into());
                }
            }

            if attempt < attempts {
                drop(state);
                sleep(self.config.connect_backoff).await;
                state = self.state.lock().await;
            }
        }

        Err(GatewayError::ExhaustedRetries {
            operation: "connect",
            attempts,
        })
    }

    pub(crate) async fn disconnect_shared(&self, link: &Arc<LinkShared>) {
        let mut state = self.state.lock().await;
        state.remove(link);
        self.disconnect_locked(link).await;
    }

    /// Tear down the transport connection; caller holds the pool lock
    async fn disconnect_locked(&self, link: &Arc<LinkShared>) {
        if link.state() != ConnectionState::Connected {
            link.set_state(ConnectionState::Disconnected);
            return;
        }
        if let Err(fault) = self.transport.disconnect(link.address()).await {
            warn!("Disconnect from {} failed: {}", link.address(), fault);
        }
        link.mark_disconnected();
    }

    async fn rescan(&self, address: &str) {
        let bound = self.config.scan_timeout;
        match timeout(bound, self.transport.scan_for_address(address, bound)).await {
            Ok(Ok(true)) => debug!("Rescan found {}", address),
            Ok(Ok(false)) => warn!("Rescan did not find {} within {:?}", address, bound),
            Ok(Err(fault)) => warn!("Rescan for {} failed: {}", address, fault),
            Err(_) => warn!("Rescan for {} timed out after {:?}", address, bound),
        }
    }

    // ------------------------------------------------------------------------
    // Characteristic Access
    // ------------------------------------------------------------------------

    pub(crate) async fn write(
        &self,
        link: &Arc<LinkShared>,
        characteristic: Uuid,
        payload: &[u8],
        with_response: bool,
    ) -> GatewayResult<()> {
        self.transport
            .write_characteristic(link.address(), characteristic, payload, with_response)
            .await?;
        link.touch();
        debug!(
            "Wrote {} to {} on {}",
            hex::encode(payload),
            link.address(),
            characteristic
        );
        Ok(())
    }

    /// Enable notifications unless already enabled on this connection
    pub(crate) async fn arm(&self, link: &Arc<LinkShared>, characteristic: Uuid) -> GatewayResult<()> {
        if !link.mark_armed(characteristic) {
            return Ok(());
        }
        if let Err(fault) = self
            .transport
            .subscribe_notify(link.address(), characteristic)
            .await
        {
            link.disarm(characteristic);
            return Err(fault.into());
        }
        debug!("Notifications enabled on {} for {}", characteristic, link.address());
        Ok(())
    }

    /// Disable notifications once no subscriber is left
    pub(crate) async fn release(&self, link: &Arc<LinkShared>, characteristic: Uuid) {
        if link.broker().subscriber_count(&characteristic) > 0 || !link.disarm(characteristic) {
            return;
        }
        if !link.is_connected() {
            return;
        }
        if let Err(fault) = self
            .transport
            .unsubscribe_notify(link.address(), characteristic)
            .await
        {
            debug!(
                "Failed to disable notifications on {} for {}: {}",
                characteristic,
                link.address(),
                fault
            );
        }
    }

    /// Re-enable notifications for every passive listener after a connect
    async fn rearm(&self, link: &Arc<LinkShared>) {
        for characteristic in link.broker().persistent_keys() {
            if let Err(e) = self.arm(link, characteristic).await {
                warn!(
                    "Failed to re-enable notifications on {} for {}: {}",
                    characteristic,
                    link.address(),
                    e
                );
            }
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("capacity", &self.config.pool_capacity)
            .finish()
    }
}
