use crossbeam_channel::{unbounded, Receiver};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::events::{Channel, Event};

/// What a subscriber did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Let later subscribers see the event
    Continue,
    /// Stop delivery on channels that short-circuit (`card-event`)
    Claimed,
}

/// Identifier returned by [`EventDispatcher::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sub({})", self.0)
    }
}

type Callback = Arc<dyn Fn(&Event) -> Delivery + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    channel: Channel,
    callback: Callback,
}

/// In-process publish/subscribe bus
///
/// Callbacks run synchronously on the publishing thread, in subscription
/// order. Subscribers are snapshotted before delivery, so a callback may
/// subscribe or unsubscribe without deadlocking; the change applies from
/// the next publish.
pub struct EventDispatcher {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Register a callback on `channel`
    pub fn subscribe<F>(&self, channel: Channel, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Delivery + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push(Subscriber {
            id,
            channel,
            callback: Arc::new(callback),
        });
        log::debug!("{id} subscribed to {channel}");
        id
    }

    /// Register a subscriber that defers handling to its own thread
    ///
    /// Events are forwarded into the returned receiver. A dropped receiver
    /// simply stops receiving; it never claims card events.
    pub fn subscribe_deferred(&self, channel: Channel) -> (SubscriptionId, Receiver<Event>) {
        let (sender, receiver) = unbounded();
        let id = self.subscribe(channel, move |event| {
            let _ = sender.send(event.clone());
            Delivery::Continue
        });
        (id, receiver)
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() != before;
        if removed {
            log::debug!("{id} unsubscribed");
        }
        removed
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.subscribers
            .read()
            .iter()
            .filter(|s| s.channel == channel)
            .count()
    }

    /// Deliver `event` to the subscribers of its channel and return how many
    /// callbacks ran
    pub fn publish(&self, event: &Event) -> usize {
        let channel = event.channel();
        let targets: Vec<Callback> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.channel == channel)
            .map(|s| Arc::clone(&s.callback))
            .collect();

        let mut delivered = 0;
        for callback in targets {
            delivered += 1;
            if callback(event) == Delivery::Claimed && channel == Channel::CardEvent {
                log::debug!("{channel} event claimed after {delivered} subscriber(s)");
                break;
            }
        }
        delivered
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
