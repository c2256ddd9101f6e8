//! Observer registry with one-shot and multi-shot subscriptions
//!
//! Dispatch never waits on a subscriber. One-shot subscribers receive through
//! a `oneshot` channel and are removed on first delivery; stream subscribers
//! get a bounded `mpsc` queue, and a full queue drops the item for that
//! subscriber only. Every subscription removes its own slot when dropped.
//!
//! [`Registry::cancel_all`] resolves every non-persistent subscriber with
//! [`GatewayError::Cancelled`]. Persistent subscribers survive it, which is
//! what lets a passive listener outlive a disconnect.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::stream::{self, Stream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

// ----------------------------------------------------------------------------
// Notification
// ----------------------------------------------------------------------------

/// One inbound characteristic value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Characteristic that produced the value
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// Per-link fan-out of inbound notifications, keyed by characteristic
pub type NotificationBroker = Registry<Uuid, Notification>;

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

enum Sink<T> {
    Once(oneshot::Sender<T>),
    Many {
        tx: mpsc::Sender<T>,
        // Dropped together with the slot; the subscriber sees the closed
        // receiver before any buffered item.
        _cancel: oneshot::Sender<()>,
    },
}

struct Slot<T> {
    id: u64,
    persistent: bool,
    sink: Sink<T>,
}

struct RegistryInner<K, T> {
    slots: Mutex<HashMap<K, Vec<Slot<T>>>>,
    next_id: AtomicU64,
    queue_depth: usize,
}

impl<K: Eq + Hash, T> RegistryInner<K, T> {
    fn lock(&self) -> MutexGuard<'_, HashMap<K, Vec<Slot<T>>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, key: &K, id: u64) {
        let mut slots = self.lock();
        if let Some(list) = slots.get_mut(key) {
            list.retain(|slot| slot.id != id);
            if list.is_empty() {
                slots.remove(key);
            }
        }
    }
}

/// Subscriber registry keyed by event name
pub struct Registry<K, T> {
    inner: Arc<RegistryInner<K, T>>,
}

impl<K, T> Clone for Registry<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, T> Registry<K, T>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    T: Clone,
{
    /// Create a registry whose stream subscribers buffer `queue_depth` items
    pub fn new(queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                slots: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                queue_depth: queue_depth.max(1),
            }),
        }
    }

    fn insert(&self, key: &K, persistent: bool, sink: Sink<T>) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .entry(key.clone())
            .or_default()
            .push(Slot {
                id,
                persistent,
                sink,
            });
        id
    }

    /// Register a subscriber for the next item under `key`
    pub fn subscribe_once(&self, key: K) -> OnceSubscription<K, T> {
        let (tx, rx) = oneshot::channel();
        let id = self.insert(&key, false, Sink::Once(tx));
        OnceSubscription {
            rx,
            key,
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Register a subscriber for every item under `key`
    ///
    /// A persistent subscription is not resolved by [`Registry::cancel_all`].
    pub fn subscribe(&self, key: K, persistent: bool) -> Subscription<K, T> {
        let (tx, rx) = mpsc::channel(self.inner.queue_depth);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let id = self.insert(
            &key,
            persistent,
            Sink::Many {
                tx,
                _cancel: cancel_tx,
            },
        );
        Subscription {
            rx,
            cancel: cancel_rx,
            cancelled: false,
            key,
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Hand `item` to every subscriber of `key`; returns how many accepted it
    pub fn dispatch(&self, key: &K, item: T) -> usize {
        let mut slots = self.inner.lock();
        let Some(list) = slots.get_mut(key) else {
            return 0;
        };

        let mut delivered = 0;
        let mut kept = Vec::with_capacity(list.len());
        for slot in list.drain(..) {
            let keep = match &slot.sink {
                Sink::Once(_) => false,
                Sink::Many { tx, .. } => match tx.try_send(item.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        warn!("Subscriber queue full for {:?}, dropping item", key);
                        true
                    }
                    Err(TrySendError::Closed(_)) => false,
                },
            };
            if keep {
                kept.push(slot);
            } else if let Sink::Once(tx) = slot.sink {
                if tx.send(item.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }

        if kept.is_empty() {
            slots.remove(key);
        } else {
            *list = kept;
        }
        delivered
    }

    /// Resolve every non-persistent subscriber with `Cancelled`
    pub fn cancel_all(&self) -> usize {
        let mut slots = self.inner.lock();
        let mut cancelled = 0;
        slots.retain(|_, list| {
            let before = list.len();
            list.retain(|slot| slot.persistent);
            cancelled += before - list.len();
            !list.is_empty()
        });
        if cancelled > 0 {
            debug!("Cancelled {} subscribers", cancelled);
        }
        cancelled
    }

    /// Live subscribers under `key`
    pub fn subscriber_count(&self, key: &K) -> usize {
        self.inner.lock().get(key).map_or(0, Vec::len)
    }

    /// Whether any persistent subscriber is registered under `key`
    pub fn has_persistent(&self, key: &K) -> bool {
        self.inner
            .lock()
            .get(key)
            .is_some_and(|list| list.iter().any(|slot| slot.persistent))
    }

    /// Keys that currently have a persistent subscriber
    pub fn persistent_keys(&self) -> Vec<K> {
        self.inner
            .lock()
            .iter()
            .filter(|(_, list)| list.iter().any(|slot| slot.persistent))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Subscriptions
// ----------------------------------------------------------------------------

/// Pending single delivery
pub struct OnceSubscription<K: Eq + Hash, T> {
    rx: oneshot::Receiver<T>,
    key: K,
    id: u64,
    registry: Weak<RegistryInner<K, T>>,
}

impl<K: Eq + Hash, T> OnceSubscription<K, T> {
    /// Wait for the item; `Cancelled` if the registry dropped the slot first
    pub async fn wait(mut self) -> GatewayResult<T> {
        (&mut self.rx).await.map_err(|_| GatewayError::Cancelled)
    }
}

impl<K: Eq + Hash, T> Drop for OnceSubscription<K, T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.key, self.id);
        }
    }
}

/// Ongoing delivery through a bounded queue
pub struct Subscription<K: Eq + Hash, T> {
    rx: mpsc::Receiver<T>,
    cancel: oneshot::Receiver<()>,
    cancelled: bool,
    key: K,
    id: u64,
    registry: Weak<RegistryInner<K, T>>,
}

impl<K, T> Subscription<K, T>
where
    K: Eq + Hash + Send + 'static,
    T: Send + 'static,
{
    /// Next item, or `Cancelled` once the slot is gone
    pub async fn recv(&mut self) -> GatewayResult<T> {
        if self.cancelled {
            return Err(GatewayError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = &mut self.cancel => {
                self.cancelled = true;
                Err(GatewayError::Cancelled)
            }
            item = self.rx.recv() => item.ok_or_else(|| {
                self.cancelled = true;
                GatewayError::Cancelled
            }),
        }
    }

    /// Adapt into a stream that ends after yielding `Cancelled`
    pub fn into_stream(self) -> impl Stream<Item = GatewayResult<T>> + Send + 'static {
        stream::unfold(Some(self), |state| async move {
            let mut subscription = state?;
            match subscription.recv().await {
                Ok(item) => Some((Ok(item), Some(subscription))),
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl<K: Eq + Hash, T> Drop for Subscription<K, T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.key, self.id);
        }
    }
}
