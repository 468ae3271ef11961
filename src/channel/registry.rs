// Multiplexed callback registry: many independent handlers per event name

use log::{debug, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle returned by [`EventRegistry::register`]; removes exactly one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Slots {
    next_id: u64,
    handlers: HashMap<String, Vec<(SubscriptionId, Handler)>>,
}

/// Cheap to clone; every clone shares the same handler table.
#[derive(Clone, Default)]
pub struct EventRegistry {
    slots: Arc<Mutex<Slots>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register<F>(&self, event: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut slots = self.lock();
        slots.next_id += 1;
        let id = SubscriptionId(slots.next_id);
        slots
            .handlers
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        debug!("Registered handler {:?} for '{}'", id, event);
        id
    }

    /// Returns false when `id` was not registered for `event`.
    pub fn unregister(&self, event: &str, id: SubscriptionId) -> bool {
        let mut slots = self.lock();
        let Some(handlers) = slots.handlers.get_mut(event) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            slots.handlers.remove(event);
        }
        removed
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.lock().handlers.get(event).map_or(0, Vec::len)
    }

    /// Invoke every handler for `event` in registration order.
    ///
    /// The table lock is released before the handlers run, so a handler may
    /// register or unregister without deadlocking.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let handlers: Vec<Handler> = match self.lock().handlers.get(event) {
            Some(handlers) => handlers.iter().map(|(_, h)| h.clone()).collect(),
            None => {
                debug!("No handlers for '{}'", event);
                return 0;
            }
        };
        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }
}

/// Decode a payload for a handler, logging instead of failing on malformed input.
pub fn decode<T: serde::de::DeserializeOwned>(event: &str, payload: &Value) -> Option<T> {
    match serde_json::from_value(payload.clone()) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Dropping malformed '{}' payload: {}", event, e);
            None
        }
    }
}
