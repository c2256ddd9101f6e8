//! One physical BLE connection
//!
//! A [`Link`] is an owned handle. It hides connect and disconnect from its
//! user: every operation goes through the pool first, and survives the
//! connect/disconnect/reconnect cycles battery devices impose. Dropping a
//! connected link tears the connection down exactly once.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::stream::{self, Stream};
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Notification, NotificationBroker};
use crate::error::{GatewayError, GatewayResult};
use crate::pool::ConnectionPool;

/// Lifecycle events buffered per receiver
const LINK_EVENT_CAPACITY: usize = 16;

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Connection state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Link lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
}

// ----------------------------------------------------------------------------
// Shared Link State
// ----------------------------------------------------------------------------

/// State shared between a link handle, the pool and the transport sink
pub(crate) struct LinkShared {
    address: String,
    state: watch::Sender<ConnectionState>,
    last_activity: Mutex<Instant>,
    broker: NotificationBroker,
    events: broadcast::Sender<LinkEvent>,
    /// Characteristics with notifications enabled on the current connection
    armed: Mutex<HashSet<Uuid>>,
    /// Number of successful connects so far
    connections: AtomicU64,
}

impl LinkShared {
    pub(crate) fn new(address: String, queue_depth: usize) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(LINK_EVENT_CAPACITY);
        Arc::new(Self {
            address,
            state,
            last_activity: Mutex::new(Instant::now()),
            broker: NotificationBroker::new(queue_depth),
            events,
            armed: Mutex::new(HashSet::new()),
            connections: AtomicU64::new(0),
        })
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub(crate) fn broker(&self) -> &NotificationBroker {
        &self.broker
    }

    /// Set a transitional state without emitting events
    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub(crate) fn mark_connected(&self) {
        self.armed().clear();
        self.touch();
        self.connections.fetch_add(1, Ordering::AcqRel);
        self.state.send_replace(ConnectionState::Connected);
        info!("Link {} connected", self.address);
        // No receivers is fine
        let _ = self.events.send(LinkEvent::Connected);
    }

    /// Move to `Disconnected`, cancelling pending receives
    ///
    /// Idempotent: only the transition out of `Connected` emits an event.
    pub(crate) fn mark_disconnected(&self) -> bool {
        let previous = self.state.send_replace(ConnectionState::Disconnected);
        if previous != ConnectionState::Connected {
            return false;
        }
        self.armed().clear();
        let cancelled = self.broker.cancel_all();
        info!(
            "Link {} disconnected ({} pending receives cancelled)",
            self.address, cancelled
        );
        let _ = self.events.send(LinkEvent::Disconnected);
        true
    }

    pub(crate) fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub(crate) fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn deliver(&self, characteristic: Uuid, value: Vec<u8>) {
        self.touch();
        debug!(
            "Notification from {} on {}: {}",
            self.address,
            characteristic,
            hex::encode(&value)
        );
        let delivered = self.broker.dispatch(
            &characteristic,
            Notification {
                characteristic,
                value,
            },
        );
        if delivered == 0 {
            debug!("No subscriber for {} on {}", characteristic, self.address);
        }
    }

    fn armed(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record notifications as enabled; false if they already were
    pub(crate) fn mark_armed(&self, characteristic: Uuid) -> bool {
        self.armed().insert(characteristic)
    }

    pub(crate) fn disarm(&self, characteristic: Uuid) -> bool {
        self.armed().remove(&characteristic)
    }

    pub(crate) fn is_armed(&self, characteristic: Uuid) -> bool {
        self.armed().contains(&characteristic)
    }

    pub(crate) fn connection_id(&self) -> u64 {
        self.connections.load(Ordering::Acquire)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

// ----------------------------------------------------------------------------
// Link Handle
// ----------------------------------------------------------------------------

/// Owned handle to one device connection
pub struct Link {
    shared: Arc<LinkShared>,
    pool: Arc<ConnectionPool>,
}

impl Link {
    /// Register a link with `pool`; nothing connects until first use
    pub fn new(pool: Arc<ConnectionPool>, address: impl Into<String>) -> Self {
        let shared = LinkShared::new(address.into(), pool.config().notification_queue_depth);
        Self { shared, pool }
    }

    pub fn address(&self) -> &str {
        self.shared.address()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Time of the last connect, write or notification
    pub fn last_activity(&self) -> Instant {
        self.shared.last_activity()
    }

    /// Identifies the current physical connection
    ///
    /// Increases on every successful connect, so state negotiated on one
    /// connection can be recognised as stale on the next.
    pub fn connection_id(&self) -> u64 {
        self.shared.connection_id()
    }

    /// Subscribe to connect/disconnect events
    pub fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.subscribe_events()
    }

    /// Watch the connection state
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.watch_state()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub(crate) fn shared(&self) -> &Arc<LinkShared> {
        &self.shared
    }

    /// Admit the link through the pool and connect if needed
    pub async fn connect(&self) -> GatewayResult<()> {
        self.pool.connect_shared(&self.shared).await
    }

    /// Disconnect now; the next operation reconnects
    pub async fn disconnect(&self) {
        self.pool.disconnect_shared(&self.shared).await;
    }

    /// Disconnect and release the handle
    pub async fn close(self) {
        self.disconnect().await;
    }

    // ------------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------------

    /// Write a characteristic with the configured retry budget
    pub async fn send(
        &self,
        characteristic: Uuid,
        payload: &[u8],
        with_response: bool,
    ) -> GatewayResult<()> {
        let retries = self.pool.config().send_retries;
        self.send_with_retries(characteristic, payload, with_response, retries)
            .await
    }

    /// Write a characteristic, reconnecting between failed attempts
    ///
    /// A failed write disconnects the link so the next attempt starts from a
    /// fresh connection. Errors that are not transport failures propagate
    /// immediately.
    pub async fn send_with_retries(
        &self,
        characteristic: Uuid,
        payload: &[u8],
        with_response: bool,
        max_retries: u32,
    ) -> GatewayResult<()> {
        for attempt in 1..=max_retries {
            let result = match self.connect().await {
                Ok(()) => {
                    self.pool
                        .write(&self.shared, characteristic, payload, with_response)
                        .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!(
                        "Send to {} failed (attempt {}/{}): {}",
                        self.address(),
                        attempt,
                        max_retries,
                        e
                    );
                    self.pool.disconnect_shared(&self.shared).await;
                    if attempt < max_retries {
                        sleep(self.pool.config().send_backoff).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(GatewayError::ExhaustedRetries {
            operation: "send",
            attempts: max_retries,
        })
    }

    // ------------------------------------------------------------------------
    // Receive
    // ------------------------------------------------------------------------

    /// Wait for the next notification on `characteristic`
    ///
    /// Cancel safe: dropping the future still disables notifications once no
    /// other subscriber is left.
    pub async fn recv(&self, characteristic: Uuid) -> GatewayResult<Notification> {
        self.connect().await?;
        let waiter = self.shared.broker().subscribe_once(characteristic);
        if !self.shared.is_connected() {
            return Err(GatewayError::Cancelled);
        }
        let release = ReleaseGuard {
            pool: Arc::clone(&self.pool),
            shared: Arc::clone(&self.shared),
            characteristic,
            pending: true,
        };
        self.pool.arm(&self.shared, characteristic).await?;

        let result = waiter.wait().await;
        release.release().await;
        result
    }

    /// Stream notifications on `characteristic` until the link disconnects
    ///
    /// The stream yields `Cancelled` once on disconnect and then ends.
    pub async fn recv_stream(&self, characteristic: Uuid) -> GatewayResult<NotificationStream> {
        self.connect().await?;
        let subscription = self.shared.broker().subscribe(characteristic, false);
        let stream = NotificationStream {
            subscription: Some(subscription),
            characteristic,
            shared: Arc::clone(&self.shared),
            pool: Arc::clone(&self.pool),
        };
        if !self.shared.is_connected() {
            return Err(GatewayError::Cancelled);
        }
        self.pool.arm(&self.shared, characteristic).await?;
        Ok(stream)
    }

    /// Listen passively on `characteristic` across reconnects
    ///
    /// Never connects by itself. Notifications are enabled now if the link is
    /// connected and again after every future connect.
    pub async fn recv_stream_opportunistic(&self, characteristic: Uuid) -> NotificationStream {
        let subscription = self.shared.broker().subscribe(characteristic, true);
        if self.shared.is_connected() {
            if let Err(e) = self.pool.arm(&self.shared, characteristic).await {
                warn!(
                    "Failed to enable notifications on {} for {}: {}",
                    characteristic,
                    self.address(),
                    e
                );
            }
        }
        NotificationStream {
            subscription: Some(subscription),
            characteristic,
            shared: Arc::clone(&self.shared),
            pool: Arc::clone(&self.pool),
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if self.shared.state() == ConnectionState::Disconnected {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Link {} dropped outside a runtime while connected", self.address());
            return;
        };
        let pool = Arc::clone(&self.pool);
        let shared = Arc::clone(&self.shared);
        handle.spawn(async move {
            pool.disconnect_shared(&shared).await;
        });
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("address", &self.address())
            .field("state", &self.state())
            .finish()
    }
}

/// Releases a one-shot receive's notify reference, also when dropped early
struct ReleaseGuard {
    pool: Arc<ConnectionPool>,
    shared: Arc<LinkShared>,
    characteristic: Uuid,
    pending: bool,
}

impl ReleaseGuard {
    async fn release(mut self) {
        self.pending = false;
        self.pool.release(&self.shared, self.characteristic).await;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if !self.pending {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let shared = Arc::clone(&self.shared);
        let characteristic = self.characteristic;
        handle.spawn(async move {
            pool.release(&shared, characteristic).await;
        });
    }
}

// ----------------------------------------------------------------------------
// Notification Stream
// ----------------------------------------------------------------------------

/// Notifications from one characteristic of one link
pub struct NotificationStream {
    subscription: Option<crate::broker::Subscription<Uuid, Notification>>,
    characteristic: Uuid,
    shared: Arc<LinkShared>,
    pool: Arc<ConnectionPool>,
}

impl NotificationStream {
    pub fn characteristic(&self) -> Uuid {
        self.characteristic
    }

    /// Next notification; `None` after the stream has ended
    pub async fn next(&mut self) -> Option<GatewayResult<Notification>> {
        let subscription = self.subscription.as_mut()?;
        match subscription.recv().await {
            Ok(notification) => Some(Ok(notification)),
            Err(e) => {
                self.finish();
                Some(Err(e))
            }
        }
    }

    /// Adapt into a [`Stream`]
    pub fn into_stream(self) -> impl Stream<Item = GatewayResult<Notification>> + Send + 'static {
        stream::unfold(self, |mut this| async move {
            let item = this.next().await?;
            Some((item, this))
        })
    }

    /// Drop the subscription and disable notifications if it was the last one
    fn finish(&mut self) {
        if self.subscription.take().is_none() {
            return;
        }
        if self.shared.broker().subscriber_count(&self.characteristic) > 0
            || !self.shared.is_armed(self.characteristic)
        {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let shared = Arc::clone(&self.shared);
        let characteristic = self.characteristic;
        handle.spawn(async move {
            pool.release(&shared, characteristic).await;
        });
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        self.finish();
    }
}
