//! Shared test fixtures: an in-memory transport and a simulated Fingerbot

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use blebridge_ble::blebridge_core::{
    split_packets, DeviceCredentials, DeviceInfo, Frame, PacketReassembler, Session, TuyaCode,
    SECURITY_FLAG_LOGIN, SECURITY_FLAG_SESSION,
};
use blebridge_ble::{
    BleTransport, GatewayConfig, LinkSink, TransportFault, FINGERBOT_NOTIFY_CHARACTERISTIC_UUID,
    FINGERBOT_WRITE_CHARACTERISTIC_UUID,
};
use uuid::Uuid;

pub const ADDRESS_A: &str = "AA:00:00:00:00:01";
pub const ADDRESS_B: &str = "AA:00:00:00:00:02";
pub const ADDRESS_C: &str = "AA:00:00:00:00:03";
pub const ADDRESS_D: &str = "AA:00:00:00:00:04";

pub const DEVICE_UUID: &str = "tuya5f2e1d0c9b8a";
pub const DEVICE_ID: &str = "bf7a6b5c4d3e2f10";
pub const LOCAL_KEY: &str = "Zx9!q2Lm0pRt";

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Defaults with short backoffs; the paused clock makes them free anyway
pub fn test_config() -> GatewayConfig {
    GatewayConfig::default()
        .with_connect_retry(10, Duration::from_secs(3))
        .with_send_retry(10, Duration::from_secs(1))
        .with_handshake_timeout(Duration::from_secs(5))
}

/// Let spawned tasks run to their next suspension point
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

// ----------------------------------------------------------------------------
// Mock Transport
// ----------------------------------------------------------------------------

/// What a scripted device does in response to a write
pub enum MockAction {
    Notify(Uuid, Vec<u8>),
    Disconnect,
}

type Responder = Box<dyn FnMut(&str, Uuid, &[u8]) -> Vec<MockAction> + Send>;

#[derive(Default)]
struct MockState {
    connected: HashSet<String>,
    sinks: HashMap<String, LinkSink>,
    scripted_connect: HashMap<String, VecDeque<TransportFault>>,
    failing_connect: HashMap<String, TransportFault>,
    scripted_writes: VecDeque<TransportFault>,
    failing_writes: Option<TransportFault>,
    connect_calls: HashMap<String, usize>,
    disconnect_calls: HashMap<String, usize>,
    scans: HashMap<String, usize>,
    writes: Vec<(String, Uuid, Vec<u8>)>,
    subscribes: Vec<(String, Uuid)>,
    unsubscribes: Vec<(String, Uuid)>,
    peak_connected: usize,
    responder: Option<Responder>,
}

/// In-memory transport with scripted failures and call counters
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    /// Fail the next connects to `address` with `faults`, in order
    pub fn script_connect_failures(&self, address: &str, faults: Vec<TransportFault>) {
        self.state()
            .scripted_connect
            .insert(address.to_string(), faults.into());
    }

    /// Fail every connect to `address`
    pub fn fail_connect_always(&self, address: &str, fault: TransportFault) {
        self.state()
            .failing_connect
            .insert(address.to_string(), fault);
    }

    /// Fail the next writes with `faults`, in order
    pub fn script_write_failures(&self, faults: Vec<TransportFault>) {
        self.state().scripted_writes = faults.into();
    }

    /// Fail every write
    pub fn fail_writes_always(&self, fault: TransportFault) {
        self.state().failing_writes = Some(fault);
    }

    pub fn set_responder(
        &self,
        responder: impl FnMut(&str, Uuid, &[u8]) -> Vec<MockAction> + Send + 'static,
    ) {
        self.state().responder = Some(Box::new(responder));
    }

    pub fn connect_count(&self, address: &str) -> usize {
        self.state().connect_calls.get(address).copied().unwrap_or(0)
    }

    pub fn disconnect_count(&self, address: &str) -> usize {
        self.state()
            .disconnect_calls
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub fn scan_count(&self, address: &str) -> usize {
        self.state().scans.get(address).copied().unwrap_or(0)
    }

    pub fn write_count(&self) -> usize {
        self.state().writes.len()
    }

    pub fn writes(&self) -> Vec<(String, Uuid, Vec<u8>)> {
        self.state().writes.clone()
    }

    pub fn subscribe_count(&self, address: &str, characteristic: Uuid) -> usize {
        self.state()
            .subscribes
            .iter()
            .filter(|(a, c)| a == address && *c == characteristic)
            .count()
    }

    pub fn unsubscribe_count(&self, address: &str, characteristic: Uuid) -> usize {
        self.state()
            .unsubscribes
            .iter()
            .filter(|(a, c)| a == address && *c == characteristic)
            .count()
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.state().connected.contains(address)
    }

    pub fn connected_count(&self) -> usize {
        self.state().connected.len()
    }

    pub fn peak_connected(&self) -> usize {
        self.state().peak_connected
    }

    /// Deliver a notification as the device would
    pub fn notify(&self, address: &str, characteristic: Uuid, value: &[u8]) -> bool {
        let sink = self.state().sinks.get(address).cloned();
        sink.is_some_and(|sink| sink.deliver(characteristic, value.to_vec()))
    }

    /// Drop the connection from the device side
    pub fn drop_connection(&self, address: &str) {
        let sink = {
            let mut state = self.state();
            state.connected.remove(address);
            state.sinks.remove(address)
        };
        if let Some(sink) = sink {
            sink.disconnected();
        }
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn connect(&self, address: &str, sink: LinkSink) -> Result<(), TransportFault> {
        let mut state = self.state();
        *state.connect_calls.entry(address.to_string()).or_default() += 1;

        if let Some(fault) = state
            .scripted_connect
            .get_mut(address)
            .and_then(VecDeque::pop_front)
        {
            return Err(fault);
        }
        if let Some(fault) = state.failing_connect.get(address) {
            return Err(fault.clone());
        }

        state.connected.insert(address.to_string());
        state.sinks.insert(address.to_string(), sink);
        state.peak_connected = state.peak_connected.max(state.connected.len());
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<(), TransportFault> {
        let mut state = self.state();
        *state
            .disconnect_calls
            .entry(address.to_string())
            .or_default() += 1;
        state.connected.remove(address);
        state.sinks.remove(address);
        Ok(())
    }

    async fn write_characteristic(
        &self,
        address: &str,
        characteristic: Uuid,
        data: &[u8],
        _with_response: bool,
    ) -> Result<(), TransportFault> {
        let (actions, sink) = {
            let mut state = self.state();
            if !state.connected.contains(address) {
                return Err(TransportFault::NotConnected {
                    address: address.to_string(),
                });
            }
            state
                .writes
                .push((address.to_string(), characteristic, data.to_vec()));
            if let Some(fault) = state.scripted_writes.pop_front() {
                return Err(fault);
            }
            if let Some(fault) = &state.failing_writes {
                return Err(fault.clone());
            }
            let actions = match state.responder.as_mut() {
                Some(responder) => responder(address, characteristic, data),
                None => Vec::new(),
            };
            (actions, state.sinks.get(address).cloned())
        };

        for action in actions {
            match action {
                MockAction::Notify(characteristic, value) => {
                    if let Some(sink) = &sink {
                        sink.deliver(characteristic, value);
                    }
                }
                MockAction::Disconnect => self.drop_connection(address),
            }
        }
        Ok(())
    }

    async fn subscribe_notify(
        &self,
        address: &str,
        characteristic: Uuid,
    ) -> Result<(), TransportFault> {
        self.state()
            .subscribes
            .push((address.to_string(), characteristic));
        Ok(())
    }

    async fn unsubscribe_notify(
        &self,
        address: &str,
        characteristic: Uuid,
    ) -> Result<(), TransportFault> {
        self.state()
            .unsubscribes
            .push((address.to_string(), characteristic));
        Ok(())
    }

    async fn scan_for_address(
        &self,
        address: &str,
        _timeout: Duration,
    ) -> Result<bool, TransportFault> {
        *self.state().scans.entry(address.to_string()).or_default() += 1;
        Ok(true)
    }
}

// ----------------------------------------------------------------------------
// Simulated Fingerbot
// ----------------------------------------------------------------------------

/// How the simulated device reacts to a pair request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairBehavior {
    Acknowledge,
    Ignore,
    Disconnect,
}

#[derive(Default)]
pub struct SimulatorLog {
    pub received: Vec<Frame>,
}

impl SimulatorLog {
    pub fn count(&self, code: TuyaCode) -> usize {
        self.received
            .iter()
            .filter(|frame| frame.code == u16::from(code))
            .count()
    }

    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.received
            .iter()
            .filter(|frame| frame.code == u16::from(TuyaCode::Dps))
            .map(|frame| frame.payload.clone())
            .collect()
    }
}

pub fn credentials() -> DeviceCredentials {
    DeviceCredentials::new(DEVICE_UUID, DEVICE_ID, LOCAL_KEY).expect("valid credentials")
}

fn device_info(server_random: [u8; 6]) -> DeviceInfo {
    DeviceInfo {
        device_version: (1, 0),
        protocol_version: (3, 3),
        flag: 0,
        is_bound: true,
        server_random,
        hardware_version: (1, 0),
        auth_key: [0x5a; 32],
    }
}

/// Install a device-side Tuya endpoint on `transport`
///
/// Answers device info and pair requests, and echoes every command back as a
/// data point report. Each device info exchange draws a new server random.
pub fn attach_fingerbot(
    transport: &MockTransport,
    pair: PairBehavior,
    answer_info: bool,
) -> Arc<Mutex<SimulatorLog>> {
    let log = Arc::new(Mutex::new(SimulatorLog::default()));
    let device_log = Arc::clone(&log);
    let mut session = Session::for_credentials(&credentials());
    let mut reassembler = PacketReassembler::new();
    let mut exchanges: u8 = 0;

    transport.set_responder(move |_address, characteristic, packet| {
        if characteristic != FINGERBOT_WRITE_CHARACTERISTIC_UUID {
            return Vec::new();
        }
        let Some(message) = reassembler.accept(packet) else {
            return Vec::new();
        };
        let frame = session.open(&message).expect("gateway sent a valid frame");
        device_log
            .lock()
            .expect("log poisoned")
            .received
            .push(frame.clone());

        let reply = match TuyaCode::try_from(frame.code) {
            Ok(TuyaCode::DeviceInfo) if answer_info => {
                exchanges = exchanges.wrapping_add(1);
                let server_random = [b'r', b'a', b'n', b'd', b'0', exchanges];
                let reply = session
                    .seal(
                        TuyaCode::DeviceInfo.into(),
                        &device_info(server_random).to_bytes(),
                        SECURITY_FLAG_LOGIN,
                        frame.sequence,
                    )
                    .expect("seal device info");
                session.set_server_random(&server_random);
                Some(reply)
            }
            Ok(TuyaCode::Pair) => match pair {
                PairBehavior::Acknowledge => Some(
                    session
                        .seal(TuyaCode::Pair.into(), &[0], SECURITY_FLAG_SESSION, frame.sequence)
                        .expect("seal pair ack"),
                ),
                PairBehavior::Ignore => None,
                PairBehavior::Disconnect => return vec![MockAction::Disconnect],
            },
            Ok(TuyaCode::Dps) => Some(
                session
                    .seal(
                        TuyaCode::ReceiveDp.into(),
                        &frame.payload,
                        SECURITY_FLAG_SESSION,
                        0,
                    )
                    .expect("seal dp report"),
            ),
            _ => None,
        };

        reply
            .map(|message| {
                split_packets(&message)
                    .expect("reply fits")
                    .into_iter()
                    .map(|packet| MockAction::Notify(FINGERBOT_NOTIFY_CHARACTERISTIC_UUID, packet))
                    .collect()
            })
            .unwrap_or_default()
    });

    log
}
