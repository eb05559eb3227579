//! In-process event bus: multi-producer, multi-subscriber, one bounded FIFO
//! per subscription.
//!
//! `publish` clones the event into every subscriber's queue and returns; a
//! publisher has no obligations past that point. A subscriber that cannot
//! keep up loses events on its own queue only, with a per-subscription drop
//! counter and a log line at each power-of-two milestone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;

use crate::alerts::AlertKind;
use crate::cache::{BatteryStatus, PackStatistics};
use crate::error::{Error, Result};

/// How long `publish` may wait for the subscriber-list lock. The list is
/// only held for queue handoffs, so hitting this means something is wedged.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    RegisterUpdated {
        address: u16,
        key: &'static str,
        raw: u16,
        user: f64,
    },
    BatteryStatus(BatteryStatus),
    PackStatistics(PackStatistics),
    LinkUp,
    LinkDown,
    /// Carries the serialized new configuration.
    ConfigUpdated(String),
    Alert {
        kind: AlertKind,
        message: String,
    },
    /// Opaque JSON from an external CAN adapter.
    CanRaw(String),
    CanDecoded(String),
    CanReady(String),
}

impl Event {
    pub fn id(&self) -> u32 {
        match self {
            Event::RegisterUpdated { .. } => 1,
            Event::BatteryStatus(_) => 2,
            Event::PackStatistics(_) => 3,
            Event::LinkUp => 4,
            Event::LinkDown => 5,
            Event::ConfigUpdated(_) => 6,
            Event::Alert { .. } => 7,
            Event::CanRaw(_) => 8,
            Event::CanDecoded(_) => 9,
            Event::CanReady(_) => 10,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::RegisterUpdated { .. } => "register_updated",
            Event::BatteryStatus(_) => "battery_status",
            Event::PackStatistics(_) => "pack_statistics",
            Event::LinkUp => "link_up",
            Event::LinkDown => "link_down",
            Event::ConfigUpdated(_) => "config_updated",
            Event::Alert { .. } => "alert",
            Event::CanRaw(_) => "can_raw",
            Event::CanDecoded(_) => "can_decoded",
            Event::CanReady(_) => "can_ready",
        }
    }
}

pub type EventCallback = Box<dyn Fn(&Event) + Send>;

struct SubscriberSlot {
    id: u64,
    name: String,
    capacity: usize,
    sender: Sender<Event>,
    sent: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

/// The consumer side of a subscription. Dropping it (or passing it to
/// [`EventBus::unsubscribe`]) discards any queued events.
pub struct Subscription {
    id: u64,
    name: String,
    capacity: usize,
    receiver: Receiver<Event>,
    sent: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    callback: Option<EventCallback>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events currently queued for this subscription.
    pub fn waiting(&self) -> usize {
        self.receiver.len()
    }

    /// Events dropped because this subscription's queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events successfully queued for this subscription.
    pub fn delivered_events(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn receive(&self, timeout: Duration) -> Option<Event> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_receive(&self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }

    /// Receives one event and runs the registered callback on it, if any.
    /// Returns the event, whether or not a callback was registered.
    pub fn dispatch(&self, timeout: Duration) -> Option<Event> {
        let event = self.receive(timeout)?;
        if let Some(callback) = &self.callback {
            callback(&event);
        }
        Some(event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde_derive::Serialize)]
pub struct SubscriptionMetrics {
    pub name: String,
    pub capacity: usize,
    pub waiting: usize,
    pub delivered: u64,
    pub dropped: u64,
}

pub struct EventBus {
    subscribers: Mutex<Vec<SubscriberSlot>>,
    next_id: AtomicU64,
    delivered_total: AtomicU64,
    dropped_total: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            delivered_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, name: &str, capacity: usize) -> Subscription {
        self.subscribe_inner(name, capacity, None)
    }

    /// Like [`subscribe`](EventBus::subscribe), but `dispatch` will invoke
    /// `callback` for each received event.
    pub fn subscribe_with_callback(
        &self,
        name: &str,
        capacity: usize,
        callback: EventCallback,
    ) -> Subscription {
        self.subscribe_inner(name, capacity, Some(callback))
    }

    fn subscribe_inner(
        &self,
        name: &str,
        capacity: usize,
        callback: Option<EventCallback>,
    ) -> Subscription {
        let (sender, receiver) = bounded(capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sent = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));
        let slot = SubscriberSlot {
            id,
            name: name.to_string(),
            capacity,
            sender,
            sent: Arc::clone(&sent),
            dropped: Arc::clone(&dropped),
        };
        self.subscribers.lock().push(slot);
        Subscription {
            id,
            name: name.to_string(),
            capacity,
            receiver,
            sent,
            dropped,
            callback,
        }
    }

    /// Removes the subscription from the bus. Events still queued on it are
    /// discarded along with the receiver.
    pub fn unsubscribe(&self, subscription: Subscription) {
        self.subscribers
            .lock()
            .retain(|slot| slot.id != subscription.id);
        drop(subscription);
    }

    /// Enqueues a copy of `event` onto every subscriber queue, waiting at
    /// most `timeout` per full queue before counting a drop for that
    /// subscriber. A drop never fails the publish.
    pub fn publish(&self, event: &Event, timeout: Duration) -> Result<()> {
        let Some(mut subscribers) = self.subscribers.try_lock_for(LOCK_TIMEOUT) else {
            log::warn!("event bus subscriber list is locked, giving up on publish");
            return Err(Error::MutexTimeout("event bus"));
        };

        subscribers.retain(|slot| {
            match slot.sender.send_timeout(event.clone(), timeout) {
                Ok(()) => {
                    slot.sent.fetch_add(1, Ordering::Relaxed);
                    self.delivered_total.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(SendTimeoutError::Timeout(_)) => {
                    let dropped = slot.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    self.dropped_total.fetch_add(1, Ordering::Relaxed);
                    log_drop_milestone(&slot.name, event.name(), dropped);
                    true
                }
                // Receiver is gone without an unsubscribe; forget the slot.
                Err(SendTimeoutError::Disconnected(_)) => false,
            }
        });
        Ok(())
    }

    /// Per-subscription metrics, for the status reporter.
    pub fn metrics(&self) -> Vec<SubscriptionMetrics> {
        self.subscribers
            .lock()
            .iter()
            .map(|slot| SubscriptionMetrics {
                name: slot.name.clone(),
                capacity: slot.capacity,
                waiting: slot.sender.len(),
                delivered: slot.sent.load(Ordering::Relaxed),
                dropped: slot.dropped.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn delivered_total(&self) -> u64 {
        self.delivered_total.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

fn log_drop_milestone(subscriber: &str, event: &str, dropped: u64) {
    if !dropped.is_power_of_two() {
        return;
    }
    if dropped >= 256 {
        log::error!("subscriber {subscriber} has dropped {dropped} events (latest: {event})");
    } else {
        log::warn!("subscriber {subscriber} has dropped {dropped} events (latest: {event})");
    }
}
