// Presence tracking
// Maintains the set of online user ids from channel events and fans
// changes out to local subscribers.

use log::{debug, info, warn};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::channel::events::names;
use crate::channel::registry::{decode, EventRegistry, SubscriptionId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: String,
    pub online: bool,
}

#[derive(Default)]
struct PresenceState {
    online: HashSet<String>,
    subscribers: Vec<mpsc::Sender<PresenceChange>>,
    subscriptions: Vec<(&'static str, SubscriptionId)>,
}

#[derive(Clone, Default)]
pub struct PresenceTracker {
    state: Arc<Mutex<PresenceState>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PresenceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe to the presence events on `registry`. Calling it again
    /// first drops the previous subscriptions.
    pub fn attach(&self, registry: &EventRegistry) {
        self.detach(registry);

        let tracker = self.clone();
        let snapshot = registry.register(names::GET_ONLINE_USERS, move |payload: &Value| {
            if let Some(users) = decode::<Vec<String>>(names::GET_ONLINE_USERS, payload) {
                tracker.replace_all(users);
            }
        });
        let tracker = self.clone();
        let online = registry.register(names::USER_ONLINE, move |payload: &Value| {
            if let Some(user_id) = decode::<String>(names::USER_ONLINE, payload) {
                tracker.set_online(&user_id, true);
            }
        });
        let tracker = self.clone();
        let offline = registry.register(names::USER_OFFLINE, move |payload: &Value| {
            if let Some(user_id) = decode::<String>(names::USER_OFFLINE, payload) {
                tracker.set_online(&user_id, false);
            }
        });

        self.lock().subscriptions = vec![
            (names::GET_ONLINE_USERS, snapshot),
            (names::USER_ONLINE, online),
            (names::USER_OFFLINE, offline),
        ];
    }

    pub fn detach(&self, registry: &EventRegistry) {
        let subscriptions = std::mem::take(&mut self.lock().subscriptions);
        for (event, id) in subscriptions {
            registry.unregister(event, id);
        }
    }

    /// Replace the whole set with a server snapshot.
    pub fn replace_all(&self, users: Vec<String>) {
        let changes = {
            let mut state = self.lock();
            let incoming: HashSet<String> = users.into_iter().collect();
            let mut changes: Vec<PresenceChange> = state
                .online
                .difference(&incoming)
                .map(|id| PresenceChange {
                    user_id: id.clone(),
                    online: false,
                })
                .collect();
            changes.extend(incoming.difference(&state.online).map(|id| PresenceChange {
                user_id: id.clone(),
                online: true,
            }));
            state.online = incoming;
            info!("Presence snapshot: {} user(s) online", state.online.len());
            changes
        };
        for change in changes {
            self.broadcast(change);
        }
    }

    pub fn set_online(&self, user_id: &str, online: bool) {
        let changed = {
            let mut state = self.lock();
            if online {
                state.online.insert(user_id.to_string())
            } else {
                state.online.remove(user_id)
            }
        };
        if changed {
            debug!("{} is now {}", user_id, if online { "online" } else { "offline" });
            self.broadcast(PresenceChange {
                user_id: user_id.to_string(),
                online,
            });
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.lock().online.contains(user_id)
    }

    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.lock().online.iter().cloned().collect();
        users.sort();
        users
    }

    pub fn online_count(&self) -> usize {
        self.lock().online.len()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<PresenceChange> {
        let (tx, rx) = mpsc::channel(100);
        self.lock().subscribers.push(tx);
        rx
    }

    // Closed subscribers are pruned here; a full one just misses this update.
    fn broadcast(&self, change: PresenceChange) {
        let mut state = self.lock();
        state.subscribers.retain(|tx| match tx.try_send(change.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Presence subscriber is full, dropping update for {}", change.user_id);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}
