use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::dispatcher::{Delivery, EventDispatcher, SubscriptionId};
use crate::core::events::{Channel, Event, StatusChangeEvent};

/// Observable effect of an event on the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateTransition {
    /// A "card present" notification should be raised
    Raised,
    /// An active notification should be cancelled
    Cleared,
    Unchanged,
}

/// Tracks, per reader, whether a "card present" notification is active
#[derive(Debug, Default)]
pub struct NotificationGate {
    active: Mutex<HashMap<String, bool>>,
}

impl NotificationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(&self, event: &StatusChangeEvent) -> GateTransition {
        let mut active = self.active.lock();
        let was_active = active.get(&event.reader).copied().unwrap_or(false);

        if event.card_present() {
            active.insert(event.reader.clone(), true);
            if was_active {
                GateTransition::Unchanged
            } else {
                log::info!("Card notification raised for {}", event.reader);
                GateTransition::Raised
            }
        } else if event.status.is_no_card() || event.status.implies_card() {
            // A card status without an ATR is a card that did not answer
            if was_active {
                active.insert(event.reader.clone(), false);
                log::info!("Card notification cleared for {}", event.reader);
                GateTransition::Cleared
            } else {
                GateTransition::Unchanged
            }
        } else {
            GateTransition::Unchanged
        }
    }

    pub fn is_active(&self, reader: &str) -> bool {
        self.active.lock().get(reader).copied().unwrap_or(false)
    }

    /// Mark the notification of `reader` as handled. Returns whether it was active.
    pub fn clear(&self, reader: &str) -> bool {
        self.active
            .lock()
            .get_mut(reader)
            .map(|active| std::mem::replace(active, false))
            .unwrap_or(false)
    }

    /// Readers with an active notification, sorted by name
    pub fn active_readers(&self) -> Vec<String> {
        let mut readers: Vec<String> = self
            .active
            .lock()
            .iter()
            .filter(|(_, active)| **active)
            .map(|(name, _)| name.clone())
            .collect();
        readers.sort();
        readers
    }

    /// Feed the gate from the `reader-status` channel
    pub fn attach(self: &Arc<Self>, dispatcher: &EventDispatcher) -> SubscriptionId {
        let gate = Arc::clone(self);
        dispatcher.subscribe(Channel::ReaderStatus, move |event| {
            if let Event::ReaderStatus(status) = event {
                gate.on_event(status);
            }
            Delivery::Continue
        })
    }
}
