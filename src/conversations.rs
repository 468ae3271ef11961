// Conversation list and unread accounting
// Every mutation runs against the state as it is at commit time (under the
// store lock), never against a copy taken before an await.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::RecordError;
use crate::models::{Conversation, Message, UserRef};
use crate::records::RecordApi;

/// Lets the window manager reset unread counts without owning the store.
pub trait ReadMarker: Send + Sync {
    fn mark_read(&self, conversation_id: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Unread counter went up by one.
    Counted,
    /// Landed in the conversation being read; the counter stays put.
    Read,
    SelfAuthored,
    /// Not in the local list yet (created server-side on first contact).
    UnknownConversation,
}

#[derive(Default)]
struct ConversationState {
    conversations: Vec<Conversation>,
    reading: Option<String>,
    load_failed: bool,
}

#[derive(Clone)]
pub struct ConversationStore {
    local_user: String,
    records: Arc<dyn RecordApi>,
    state: Arc<Mutex<ConversationState>>,
}

fn latest_activity(conversation: &Conversation) -> Option<DateTime<Utc>> {
    conversation.last_message.as_ref().map(|m| m.created_at)
}

impl ConversationStore {
    pub fn new(local_user: impl Into<String>, records: Arc<dyn RecordApi>) -> Self {
        Self {
            local_user: local_user.into(),
            records,
            state: Arc::new(Mutex::new(ConversationState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConversationState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    /// Replace local state with the authoritative list. On failure the
    /// previous list stays in place and `load_failed` is raised.
    pub async fn load_conversations(&self) -> bool {
        match self.records.list_conversations().await {
            Ok(mut conversations) => {
                let mut state = self.lock();
                // What is on screen right now counts as read, whatever the server says.
                if let Some(reading) = state.reading.clone() {
                    if let Some(open) = conversations.iter_mut().find(|c| c.id == reading) {
                        open.unread_counts.insert(self.local_user.clone(), 0);
                    }
                }
                info!("Loaded {} conversation(s)", conversations.len());
                state.conversations = conversations;
                state.load_failed = false;
                true
            }
            Err(e) => {
                let mut state = self.lock();
                warn!(
                    "Failed to load conversations, keeping {} cached: {}",
                    state.conversations.len(),
                    e
                );
                state.load_failed = true;
                false
            }
        }
    }

    pub fn apply_incoming_message(&self, message: &Message) -> ApplyOutcome {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(conversation) = state
            .conversations
            .iter_mut()
            .find(|c| c.id == message.conversation_id)
        else {
            debug!("Message {} for unknown conversation {}", message.id, message.conversation_id);
            return ApplyOutcome::UnknownConversation;
        };

        conversation.last_message = Some(message.clone());
        if message.sender_id() == self.local_user {
            ApplyOutcome::SelfAuthored
        } else if state.reading.as_deref() == Some(conversation.id.as_str()) {
            ApplyOutcome::Read
        } else {
            *conversation
                .unread_counts
                .entry(self.local_user.clone())
                .or_insert(0) += 1;
            ApplyOutcome::Counted
        }
    }

    /// Zero the local user's counter. Returns the count that was cleared.
    pub fn mark_read(&self, conversation_id: &str) -> u32 {
        let mut state = self.lock();
        match state.conversations.iter_mut().find(|c| c.id == conversation_id) {
            Some(conversation) => conversation
                .unread_counts
                .insert(self.local_user.clone(), 0)
                .unwrap_or(0),
            None => 0,
        }
    }

    /// Record which conversation is on screen. A list reload keeps it at zero unread.
    pub fn set_reading(&self, conversation_id: Option<String>) {
        self.lock().reading = conversation_id;
    }

    pub fn reading(&self) -> Option<String> {
        self.lock().reading.clone()
    }

    pub fn total_unread(&self) -> u32 {
        self.lock()
            .conversations
            .iter()
            .map(|c| c.unread_for(&self.local_user))
            .fold(0u32, u32::saturating_add)
    }

    pub fn unread_for(&self, conversation_id: &str) -> u32 {
        self.lock()
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .map_or(0, |c| c.unread_for(&self.local_user))
    }

    pub fn get(&self, conversation_id: &str) -> Option<Conversation> {
        self.lock()
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .cloned()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.lock().conversations.clone()
    }

    pub fn load_failed(&self) -> bool {
        self.lock().load_failed
    }

    /// Display order: anything unread first (count size does not matter),
    /// then most recent activity first.
    pub fn sorted(&self) -> Vec<Conversation> {
        let mut conversations = self.conversations();
        let user = self.local_user.as_str();
        conversations.sort_by(|a, b| {
            let a_unread = a.unread_for(user) > 0;
            let b_unread = b.unread_for(user) > 0;
            b_unread
                .cmp(&a_unread)
                .then_with(|| latest_activity(b).cmp(&latest_activity(a)))
        });
        conversations
    }

    /// Create-or-fetch a conversation with `receiver_id` and make sure it is listed.
    pub async fn start_conversation(&self, receiver_id: &str) -> Result<Conversation, RecordError> {
        let created = self.records.create_conversation(receiver_id).await?;
        let mut state = self.lock();
        if let Some(existing) = state.conversations.iter().find(|c| c.id == created.id) {
            return Ok(existing.clone());
        }
        state.conversations.insert(0, created.clone());
        Ok(created)
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<UserRef>, RecordError> {
        self.records.search_users(query).await
    }
}

impl ReadMarker for ConversationStore {
    fn mark_read(&self, conversation_id: &str) {
        ConversationStore::mark_read(self, conversation_id);
    }
}
