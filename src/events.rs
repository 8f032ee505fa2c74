//! Pool Event System
//!
//! Pub/sub notifications of fleet state changes. Subscribers receive an
//! event whenever the allocation picture (available / allocated /
//! unavailable) may have shifted and can pull a fresh snapshot with
//! `DeviceManager::list_devices`.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use tracing::debug;

/// Events emitted by the device pool
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A device was leased to a caller
    DeviceAllocated { serial: String },
    /// A leased device was returned
    DeviceFreed { serial: String },
    /// The fleet picture changed (connect, disconnect, admission, mode switch)
    FleetChanged,
}

/// Subscriber handle for receiving pool events
#[derive(Clone)]
pub struct EventSubscription {
    receiver: Receiver<PoolEvent>,
}

impl EventSubscription {
    /// Receive the next event (blocking)
    pub fn recv(&self) -> Result<PoolEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&self) -> Result<PoolEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Get an iterator over pending events
    pub fn iter(&self) -> impl Iterator<Item = PoolEvent> + '_ {
        self.receiver.try_iter()
    }
}

/// Event bus for publish/subscribe pattern
pub struct EventBus {
    subscribers: RwLock<Vec<Sender<PoolEvent>>>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> EventSubscription {
        let (sender, receiver) = unbounded();
        self.subscribers.write().push(sender);
        EventSubscription { receiver }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: PoolEvent) -> usize {
        let subscribers = self.subscribers.read();
        let mut delivered = 0;

        for sender in subscribers.iter() {
            if sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }

        debug!("Event {:?} delivered to {} subscribers", event, delivered);
        delivered
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
