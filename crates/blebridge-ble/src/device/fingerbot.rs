//! Tuya Fingerbot adapter
//!
//! Tuya devices drop the connection on their own after a short idle period,
//! and every new connection needs a fresh handshake. The adapter therefore
//! keeps the secure channel tagged with the connection it was negotiated on
//! and starts over whenever the link's connection id moves on.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use blebridge_core::{
    split_packets, ChannelEvent, DataPoint, DeviceCredentials, HandshakeState, SecureChannel,
};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::broker::{OnceSubscription, Registry};
use crate::config::FingerbotConfig;
use crate::device::{DeviceAdapter, DeviceEvent};
use crate::error::{GatewayError, GatewayResult};
use crate::link::{Link, LinkEvent, NotificationStream};
use crate::pool::ConnectionPool;
use crate::protocol::{FINGERBOT_NOTIFY_CHARACTERISTIC_UUID, FINGERBOT_WRITE_CHARACTERISTIC_UUID};

const DEVICE_EVENT_CAPACITY: usize = 32;

// ----------------------------------------------------------------------------
// Data Points
// ----------------------------------------------------------------------------

/// Fingerbot data point ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FingerbotDp {
    ToggleSwitch = 2,
    Mode = 8,
    ArmDownPercent = 9,
    ClickSustainTime = 10,
    InvertSwitch = 11,
    ArmUpPercent = 15,
    TapEnable = 17,
    Click = 101,
    Program = 121,
}

impl FingerbotDp {
    pub fn id(self) -> u8 {
        self as u8
    }
}

/// Data points for a single press in click mode
pub fn press_points(down_percent: u8) -> Vec<DataPoint> {
    vec![
        DataPoint::enumeration(FingerbotDp::Mode.id(), 0),
        DataPoint::integer(FingerbotDp::ArmDownPercent.id(), u32::from(down_percent)),
        DataPoint::integer(FingerbotDp::ArmUpPercent.id(), 0),
        DataPoint::integer(FingerbotDp::ClickSustainTime.id(), 0),
        DataPoint::boolean(FingerbotDp::Click.id(), true),
    ]
}

// ----------------------------------------------------------------------------
// Channel State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Milestone {
    SessionUpdated,
    Paired,
}

/// Secure channel plus the connection it belongs to
struct ChannelState {
    channel: SecureChannel,
    connection_id: u64,
}

impl ChannelState {
    /// Channel for `connection_id`, discarding a session from an older one
    fn for_connection(&mut self, connection_id: u64) -> &mut SecureChannel {
        if self.connection_id != connection_id {
            if self.channel.state() != HandshakeState::Unpaired {
                debug!("Discarding session from connection {}", self.connection_id);
            }
            self.channel.reset();
            self.connection_id = connection_id;
        }
        &mut self.channel
    }
}

/// Everything the background tasks share with the adapter
struct Shared {
    identifier: String,
    link: Link,
    channel: Mutex<ChannelState>,
    /// Held for a whole handshake so concurrent callers share one exchange
    handshake: Mutex<()>,
    /// Keeps the packets of one message contiguous on the wire
    writer: Mutex<()>,
    milestones: Registry<Milestone, ()>,
    events: broadcast::Sender<DeviceEvent>,
    utc_offset_secs: i32,
}

impl Shared {
    async fn with_channel<R>(&self, f: impl FnOnce(&mut SecureChannel) -> R) -> R {
        let connection_id = self.link.connection_id();
        let mut state = self.channel.lock().await;
        f(state.for_connection(connection_id))
    }

    fn emit(&self, event: DeviceEvent) {
        // No telemetry subscriber is fine
        let _ = self.events.send(event);
    }

    /// Fragment one sealed message and write it packet by packet
    async fn send_message(&self, message: &[u8]) -> GatewayResult<()> {
        let _writer = self.writer.lock().await;
        for packet in split_packets(message)? {
            self.link
                .send(FINGERBOT_WRITE_CHARACTERISTIC_UUID, &packet, false)
                .await?;
        }
        Ok(())
    }

    async fn handle_event(self: &Arc<Self>, event: ChannelEvent) {
        match event {
            ChannelEvent::SessionUpdated(_) => {
                self.milestones.dispatch(&Milestone::SessionUpdated, ());
                self.emit(DeviceEvent::SessionUpdated);
            }
            ChannelEvent::Paired => {
                info!("{} paired", self.identifier);
                self.milestones.dispatch(&Milestone::Paired, ());
                self.emit(DeviceEvent::Paired);
            }
            ChannelEvent::DataPoints(points) => {
                debug!("{} reported {} data points", self.identifier, points.len());
                self.emit(DeviceEvent::StateChanged(points));
            }
            ChannelEvent::TimeRequested { sequence } => {
                debug!("{} requested time (seq {})", self.identifier, sequence);
                let unix_millis = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or_default();
                let reply = self
                    .with_channel(|channel| channel.time_response(unix_millis, self.utc_offset_secs))
                    .await;
                match reply {
                    Ok(reply) => {
                        // Off the listener so notifications keep flowing
                        let shared = Arc::clone(self);
                        tokio::spawn(async move {
                            if let Err(e) = shared.send_message(&reply).await {
                                warn!("Failed to answer time request from {}: {}", shared.identifier, e);
                            }
                        });
                    }
                    Err(e) => warn!("Failed to build time reply for {}: {}", self.identifier, e),
                }
            }
            ChannelEvent::Message(frame) => {
                debug!(
                    "{} sent unhandled code {:#06x}",
                    self.identifier, frame.code
                );
            }
        }
    }

    /// Feed notifications into the channel until the stream ends
    async fn listen(self: Arc<Self>, mut stream: NotificationStream) {
        while let Some(item) = stream.next().await {
            let notification = match item {
                Ok(notification) => notification,
                Err(e) => {
                    debug!("Notification stream for {} ended: {}", self.identifier, e);
                    break;
                }
            };

            let outcome = self
                .with_channel(|channel| channel.accept_packet(&notification.value))
                .await;
            match outcome {
                None => {}
                Some(Ok(event)) => self.handle_event(event).await,
                Some(Err(e)) => warn!("Discarding message from {}: {}", self.identifier, e),
            }
        }
    }

    /// Forward link lifecycle as telemetry and fail pending handshake waits
    async fn watch_lifecycle(self: Arc<Self>, mut events: broadcast::Receiver<LinkEvent>) {
        loop {
            match events.recv().await {
                Ok(LinkEvent::Connected) => self.emit(DeviceEvent::Connected),
                Ok(LinkEvent::Disconnected) => {
                    self.milestones.cancel_all();
                    self.emit(DeviceEvent::Disconnected);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("{} missed {} link events", self.identifier, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tuya Fingerbot
// ----------------------------------------------------------------------------

/// Adaprox Fingerbot speaking the Tuya BLE protocol
pub struct TuyaFingerBot {
    shared: Arc<Shared>,
    down_percent: u8,
    handshake_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl TuyaFingerBot {
    /// Create an adapter over `link`
    pub fn new(link: Link, config: &FingerbotConfig, handshake_timeout: Duration) -> GatewayResult<Self> {
        let credentials = DeviceCredentials::new(&config.uuid, &config.device_id, &config.local_key)?;
        let (events, _) = broadcast::channel(DEVICE_EVENT_CAPACITY);
        let queue_depth = link.pool().config().notification_queue_depth;

        Ok(Self {
            shared: Arc::new(Shared {
                identifier: config.identifier(),
                channel: Mutex::new(ChannelState {
                    channel: SecureChannel::new(credentials),
                    connection_id: link.connection_id(),
                }),
                link,
                handshake: Mutex::new(()),
                writer: Mutex::new(()),
                milestones: Registry::new(queue_depth),
                events,
                utc_offset_secs: config.utc_offset_secs,
            }),
            down_percent: config.down_percent,
            handshake_timeout,
            tasks: Vec::new(),
        })
    }

    /// Create an adapter with its own link in `pool`
    pub fn from_config(pool: &Arc<ConnectionPool>, config: FingerbotConfig) -> GatewayResult<Self> {
        let link = Link::new(Arc::clone(pool), config.address.clone());
        let handshake_timeout = pool.config().handshake_timeout;
        Self::new(link, &config, handshake_timeout)
    }

    pub fn link(&self) -> &Link {
        &self.shared.link
    }

    /// Handshake state of the current session
    pub async fn handshake_state(&self) -> HandshakeState {
        self.shared.with_channel(|channel| channel.state()).await
    }

    /// Make sure the current connection carries a paired session
    ///
    /// Runs the device info and pair exchanges if needed. Each wait is
    /// bounded by the handshake timeout; a disconnect while waiting yields
    /// `Cancelled`. Concurrent callers queue behind one handshake.
    pub async fn sync_session(&self) -> GatewayResult<()> {
        let _handshake = self.shared.handshake.lock().await;
        self.shared.link.connect().await?;
        if self.shared.with_channel(|channel| channel.is_paired()).await {
            return Ok(());
        }

        let session_updated = self.shared.milestones.subscribe_once(Milestone::SessionUpdated);
        let request = self
            .shared
            .with_channel(|channel| {
                if !matches!(
                    channel.state(),
                    HandshakeState::Unpaired | HandshakeState::InfoRequested
                ) {
                    channel.reset();
                }
                channel.device_info_request()
            })
            .await?;
        self.shared.send_message(&request).await?;
        self.await_milestone(session_updated, "device info exchange").await?;

        let paired = self.shared.milestones.subscribe_once(Milestone::Paired);
        let request = self
            .shared
            .with_channel(|channel| channel.pair_request())
            .await?;
        self.shared.send_message(&request).await?;
        self.await_milestone(paired, "pairing").await
    }

    async fn await_milestone(
        &self,
        waiter: OnceSubscription<Milestone, ()>,
        operation: &'static str,
    ) -> GatewayResult<()> {
        match timeout(self.handshake_timeout, waiter.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("{} timed out waiting for {}", self.shared.identifier, operation);
                Err(GatewayError::Timeout { operation })
            }
        }
    }

    /// Send data point commands over a paired session
    pub async fn send_command(&self, points: &[DataPoint]) -> GatewayResult<()> {
        self.sync_session().await?;
        let message = self
            .shared
            .with_channel(|channel| channel.command_request(points))
            .await?;
        self.shared.send_message(&message).await
    }

    /// Press once with the configured arm travel
    pub async fn press(&self) -> GatewayResult<()> {
        info!("Pressing {}", self.shared.identifier);
        self.send_command(&press_points(self.down_percent)).await
    }
}

#[async_trait]
impl DeviceAdapter for TuyaFingerBot {
    fn identifier(&self) -> &str {
        &self.shared.identifier
    }

    async fn open(&mut self) -> GatewayResult<()> {
        if !self.tasks.is_empty() {
            return Ok(());
        }
        let events = self.shared.link.events();
        self.tasks.push(tokio::spawn(
            Arc::clone(&self.shared).watch_lifecycle(events),
        ));

        let stream = self
            .shared
            .link
            .recv_stream_opportunistic(FINGERBOT_NOTIFY_CHARACTERISTIC_UUID)
            .await;
        self.tasks
            .push(tokio::spawn(Arc::clone(&self.shared).listen(stream)));
        info!("Opened {}", self.shared.identifier);
        Ok(())
    }

    async fn close(&mut self) {
        self.shared.link.disconnect().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("Closed {}", self.shared.identifier);
    }

    fn bind_telemetry(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events.subscribe()
    }

    async fn handle_incoming_control(&self, topic: &[&str], data: Option<&str>) -> GatewayResult<()> {
        match (topic, data) {
            (["set", "action"], Some(_)) => self.press().await,
            (["ping"], Some(_)) => self.sync_session().await,
            _ => {
                debug!("{} ignoring control topic {:?}", self.shared.identifier, topic);
                Ok(())
            }
        }
    }
}

impl Drop for TuyaFingerBot {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
