// Chat window stacking: open panels (`active`) and bubbles (`minimized`).
// Both lists are saved on every change and restored at startup; the
// storage backend sits behind `WindowStore`.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::conversations::ReadMarker;
use crate::models::ConversationRef;

pub const ACTIVE_KEY: &str = "active_chats";
pub const MINIMIZED_KEY: &str = "minimized_chats";

pub trait WindowStore: Send + Sync {
    fn load(&self, key: &str) -> Option<String>;
    fn save(&self, key: &str, value: &str) -> io::Result<()>;
}

/// One JSON file per key under `dir`.
pub struct FileWindowStore {
    dir: PathBuf,
}

impl FileWindowStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl WindowStore for FileWindowStore {
    fn load(&self, key: &str) -> Option<String> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Some(contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Could not read window state '{}': {}", key, e);
                None
            }
        }
    }

    fn save(&self, key: &str, value: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path_for(key), value)
    }
}

#[derive(Default)]
pub struct MemoryWindowStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }
}

impl WindowStore for MemoryWindowStore {
    fn load(&self, key: &str) -> Option<String> {
        self.get(key)
    }

    fn save(&self, key: &str, value: &str) -> io::Result<()> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    pub active: Vec<ConversationRef>,
    pub minimized: Vec<ConversationRef>,
}

impl WindowState {
    /// Drop duplicate ids and keep an id that is in both lists only in `active`.
    fn repaired(self) -> Self {
        let mut seen = HashSet::new();
        let active: Vec<ConversationRef> = self
            .active
            .into_iter()
            .filter(|c| seen.insert(c.id.clone()))
            .collect();
        let minimized = self
            .minimized
            .into_iter()
            .filter(|c| seen.insert(c.id.clone()))
            .collect();
        Self { active, minimized }
    }
}

fn load_list(store: &dyn WindowStore, key: &str) -> Vec<ConversationRef> {
    let Some(raw) = store.load(key) else {
        return Vec::new();
    };
    match serde_json::from_str(&raw) {
        Ok(list) => list,
        Err(e) => {
            warn!("Ignoring corrupt window state '{}': {}", key, e);
            Vec::new()
        }
    }
}

pub struct WindowManager {
    store: Arc<dyn WindowStore>,
    read_marker: Arc<dyn ReadMarker>,
    state: Mutex<WindowState>,
}

impl WindowManager {
    /// Load both lists; missing or corrupt entries come back empty.
    pub fn restore(store: Arc<dyn WindowStore>, read_marker: Arc<dyn ReadMarker>) -> Self {
        let state = WindowState {
            active: load_list(store.as_ref(), ACTIVE_KEY),
            minimized: load_list(store.as_ref(), MINIMIZED_KEY),
        }
        .repaired();
        debug!(
            "Restored {} active and {} minimized window(s)",
            state.active.len(),
            state.minimized.len()
        );
        Self {
            store,
            read_marker,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> WindowState {
        self.lock().clone()
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.lock().active.iter().any(|c| c.id == conversation_id)
    }

    pub fn is_minimized(&self, conversation_id: &str) -> bool {
        self.lock().minimized.iter().any(|c| c.id == conversation_id)
    }

    /// Show as a panel and mark it read. Returns true when it was not already active.
    pub fn open(&self, conversation: ConversationRef) -> bool {
        let id = conversation.id.clone();
        let newly_active = {
            let mut state = self.lock();
            state.minimized.retain(|c| c.id != id);
            let newly_active = !state.active.iter().any(|c| c.id == id);
            if newly_active {
                state.active.push(conversation);
            }
            self.persist(&state);
            newly_active
        };
        self.read_marker.mark_read(&id);
        newly_active
    }

    pub fn minimize(&self, conversation: ConversationRef) {
        let mut state = self.lock();
        state.active.retain(|c| c.id != conversation.id);
        if !state.minimized.iter().any(|c| c.id == conversation.id) {
            state.minimized.push(conversation);
        }
        self.persist(&state);
    }

    pub fn close(&self, conversation_id: &str) {
        let mut state = self.lock();
        state.active.retain(|c| c.id != conversation_id);
        state.minimized.retain(|c| c.id != conversation_id);
        self.persist(&state);
    }

    // Runs under the state lock so saves land in mutation order.
    fn persist(&self, state: &WindowState) {
        for (key, list) in [(ACTIVE_KEY, &state.active), (MINIMIZED_KEY, &state.minimized)] {
            let saved = serde_json::to_string(list)
                .map_err(io::Error::from)
                .and_then(|json| self.store.save(key, &json));
            if let Err(e) = saved {
                warn!("Failed to persist window state '{}': {}", key, e);
            }
        }
    }
}
