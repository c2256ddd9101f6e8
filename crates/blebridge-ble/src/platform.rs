//! `btleplug` implementation of [`BleTransport`]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult, TransportFault};
use crate::transport::{BleTransport, LinkSink};

/// BlueZ reports a locally aborted LE connection with this detail
const LOCAL_ABORT_MARKER: &str = "le-connection-abort-by-local";

/// Poll interval while scanning for one address
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

type SinkMap = Arc<Mutex<HashMap<PeripheralId, LinkSink>>>;

fn lock_sinks(sinks: &SinkMap) -> MutexGuard<'_, HashMap<PeripheralId, LinkSink>> {
    sinks.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Error Classification
// ----------------------------------------------------------------------------

fn classify(address: &str, error: btleplug::Error) -> TransportFault {
    match error {
        btleplug::Error::DeviceNotFound => TransportFault::DeviceNotFound {
            address: address.to_string(),
        },
        btleplug::Error::NotConnected => TransportFault::NotConnected {
            address: address.to_string(),
        },
        other => {
            let message = other.to_string();
            if message.contains(LOCAL_ABORT_MARKER) {
                TransportFault::LocalAbort(message)
            } else {
                TransportFault::Other(message)
            }
        }
    }
}

/// Await post-connect setup, closing a connection this attempt opened if it fails
///
/// The pool only disconnects links it saw connected, so a half-set-up
/// connection must be torn down here.
async fn finish_connect<T, S, C>(
    address: &str,
    opened: bool,
    setup: S,
    cleanup: C,
) -> Result<T, TransportFault>
where
    S: Future<Output = Result<T, TransportFault>>,
    C: Future<Output = Result<(), TransportFault>>,
{
    match setup.await {
        Ok(value) => Ok(value),
        Err(fault) => {
            if opened {
                if let Err(e) = cleanup.await {
                    warn!("Failed to close half-open connection to {}: {}", address, e);
                }
            }
            Err(fault)
        }
    }
}

// ----------------------------------------------------------------------------
// Btleplug Transport
// ----------------------------------------------------------------------------

/// Transport over the first system BLE adapter
pub struct BtleplugTransport {
    adapter: Adapter,
    peripherals: RwLock<HashMap<String, Peripheral>>,
    sinks: SinkMap,
    forwarders: Mutex<HashMap<String, JoinHandle<()>>>,
    events_task: JoinHandle<()>,
}

impl BtleplugTransport {
    /// Open the first adapter and start watching for remote disconnects
    pub async fn new() -> GatewayResult<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| GatewayError::Transport(TransportFault::Other(format!(
                "Failed to create BLE manager: {}",
                e
            ))))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| GatewayError::Transport(TransportFault::Other(format!(
                "Failed to get BLE adapters: {}",
                e
            ))))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                GatewayError::Transport(TransportFault::Other("No BLE adapters available".into()))
            })?;

        let sinks: SinkMap = Arc::new(Mutex::new(HashMap::new()));
        let mut events = adapter
            .events()
            .await
            .map_err(|e| GatewayError::Transport(TransportFault::Other(format!(
                "Failed to get adapter events: {}",
                e
            ))))?;

        let event_sinks = Arc::clone(&sinks);
        let events_task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    let sink = lock_sinks(&event_sinks).remove(&id);
                    if let Some(sink) = sink {
                        debug!("Adapter reported disconnect of {:?}", id);
                        sink.disconnected();
                    }
                }
            }
            debug!("Adapter event stream ended");
        });

        info!("BLE adapter initialized");
        Ok(Self {
            adapter,
            peripherals: RwLock::new(HashMap::new()),
            sinks,
            forwarders: Mutex::new(HashMap::new()),
            events_task,
        })
    }

    fn forwarders(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.forwarders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral, TransportFault> {
        let key = address.to_uppercase();
        if let Some(peripheral) = self.peripherals.read().await.get(&key) {
            return Ok(peripheral.clone());
        }

        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| classify(address, e))?;
        let peripheral = peripherals
            .into_iter()
            .find(|p| p.address().to_string().eq_ignore_ascii_case(address))
            .ok_or_else(|| TransportFault::DeviceNotFound {
                address: address.to_string(),
            })?;

        self.peripherals
            .write()
            .await
            .insert(key, peripheral.clone());
        Ok(peripheral)
    }

    async fn find_characteristic(
        &self,
        address: &str,
        characteristic: Uuid,
    ) -> Result<(Peripheral, Characteristic), TransportFault> {
        let peripheral = self.find_peripheral(address).await?;
        let found = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or_else(|| TransportFault::CharacteristicNotFound {
                characteristic: characteristic.to_string(),
            })?;
        Ok((peripheral, found))
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn connect(&self, address: &str, sink: LinkSink) -> Result<(), TransportFault> {
        let peripheral = self.find_peripheral(address).await?;
        let opened = !peripheral
            .is_connected()
            .await
            .map_err(|e| classify(address, e))?;
        if opened {
            peripheral.connect().await.map_err(|e| classify(address, e))?;
        }

        let setup = async {
            if let Err(e) = peripheral.discover_services().await {
                return Err(classify(address, e));
            }
            peripheral
                .notifications()
                .await
                .map_err(|e| classify(address, e))
        };
        let cleanup = async {
            peripheral
                .disconnect()
                .await
                .map_err(|e| classify(address, e))
        };
        let mut notifications = finish_connect(address, opened, setup, cleanup).await?;
        lock_sinks(&self.sinks).insert(peripheral.id(), sink.clone());

        let forward_address = address.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if !sink.deliver(notification.uuid, notification.value) {
                    break;
                }
            }
            debug!("Notification forwarder for {} ended", forward_address);
        });
        if let Some(previous) = self.forwarders().insert(address.to_uppercase(), forwarder) {
            previous.abort();
        }
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<(), TransportFault> {
        if let Some(forwarder) = self.forwarders().remove(&address.to_uppercase()) {
            forwarder.abort();
        }
        let peripheral = self.find_peripheral(address).await?;
        lock_sinks(&self.sinks).remove(&peripheral.id());
        peripheral
            .disconnect()
            .await
            .map_err(|e| classify(address, e))
    }

    async fn write_characteristic(
        &self,
        address: &str,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportFault> {
        let (peripheral, found) = self.find_characteristic(address, characteristic).await?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        peripheral
            .write(&found, data, write_type)
            .await
            .map_err(|e| classify(address, e))
    }

    async fn subscribe_notify(
        &self,
        address: &str,
        characteristic: Uuid,
    ) -> Result<(), TransportFault> {
        let (peripheral, found) = self.find_characteristic(address, characteristic).await?;
        peripheral
            .subscribe(&found)
            .await
            .map_err(|e| classify(address, e))
    }

    async fn unsubscribe_notify(
        &self,
        address: &str,
        characteristic: Uuid,
    ) -> Result<(), TransportFault> {
        let (peripheral, found) = self.find_characteristic(address, characteristic).await?;
        peripheral
            .unsubscribe(&found)
            .await
            .map_err(|e| classify(address, e))
    }

    async fn scan_for_address(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<bool, TransportFault> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| classify(address, e))?;

        let deadline = Instant::now() + timeout;
        let mut found = false;
        while Instant::now() < deadline {
            if self.find_peripheral(address).await.is_ok() {
                found = true;
                break;
            }
            sleep(SCAN_POLL_INTERVAL).await;
        }

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        debug!("Scan for {} finished, found: {}", address, found);
        Ok(found)
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.events_task.abort();
        for (_, forwarder) in self.forwarders().drain() {
            forwarder.abort();
        }
    }
}
