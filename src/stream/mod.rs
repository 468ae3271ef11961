// Per-conversation message stream
// Paged history (newest page first, older pages prepended), live appends with
// id de-duplication, and optimistic sends reconciled by temp id.

use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

pub mod draft;
pub mod scroll;

use crate::channel::events::{names, SendAck, SendMessage};
use crate::channel::EventSink;
use crate::error::ChannelError;
use crate::models::{Attachment, Message, MessageStatus, SenderRef, UserRef};
use crate::records::RecordApi;
use draft::LocalFile;

pub const TEMP_ID_PREFIX: &str = "temp-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSizes {
    /// First paint.
    pub initial: u32,
    /// Each backward scroll.
    pub older: u32,
}

impl Default for PageSizes {
    fn default() -> Self {
        Self { initial: 20, older: 10 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    Loaded { added: usize, has_more: bool },
    /// Server already returned a short page; nothing requested.
    Exhausted,
    /// Another fetch for this stream is still in flight.
    Busy,
    /// Stream was closed or reopened while the fetch was in flight.
    Stale,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Sent(Message),
    /// The placeholder stays in the stream with `status = failed`.
    Failed { temp_id: String },
    /// Empty message with nothing attached.
    Rejected,
}

#[derive(Default)]
struct StreamState {
    messages: Vec<Message>,
    has_more: bool,
    initial_loading: bool,
    older_loading: bool,
    // Bumped by open/close; responses from an older generation are dropped.
    generation: u64,
    // Files whose upload failed, keyed by the failed entry's id.
    unsent_files: HashMap<String, LocalFile>,
}

#[derive(Clone)]
pub struct MessageStream {
    conversation_id: String,
    local_user: UserRef,
    records: Arc<dyn RecordApi>,
    sink: Arc<dyn EventSink>,
    sizes: PageSizes,
    state: Arc<Mutex<StreamState>>,
}

impl MessageStream {
    pub fn new(
        conversation_id: impl Into<String>,
        local_user: UserRef,
        records: Arc<dyn RecordApi>,
        sink: Arc<dyn EventSink>,
        sizes: PageSizes,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            local_user,
            records,
            sink,
            sizes,
            state: Arc::new(Mutex::new(StreamState {
                has_more: true,
                ..StreamState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    pub fn has_more(&self) -> bool {
        self.lock().has_more
    }

    pub fn is_loading(&self) -> bool {
        let state = self.lock();
        state.initial_loading || state.older_loading
    }

    pub fn get(&self, message_id: &str) -> Option<Message> {
        self.lock().messages.iter().find(|m| m.id == message_id).cloned()
    }

    /// Reset and load the newest page. History always comes fresh from the server.
    pub async fn open(&self) -> PageOutcome {
        let generation = {
            let mut state = self.lock();
            state.generation += 1;
            state.messages.clear();
            state.unsent_files.clear();
            state.has_more = true;
            state.initial_loading = true;
            state.older_loading = false;
            state.generation
        };

        let limit = self.sizes.initial;
        let result = self.records.fetch_messages(&self.conversation_id, 1, limit).await;

        let mut state = self.lock();
        if state.generation != generation {
            debug!("Discarding stale first page for {}", self.conversation_id);
            return PageOutcome::Stale;
        }
        state.initial_loading = false;
        match result {
            Ok(mut page) => {
                page.sort_by_key(|m| m.created_at);
                let fetched = page.len();
                // Live messages may have arrived while the page was in flight.
                let live: Vec<Message> = state
                    .messages
                    .drain(..)
                    .filter(|m| !page.iter().any(|p| p.id == m.id))
                    .collect();
                page.extend(live);
                state.messages = page;
                state.has_more = fetched >= limit as usize;
                info!(
                    "Loaded {} message(s) for {} (more: {})",
                    fetched, self.conversation_id, state.has_more
                );
                PageOutcome::Loaded {
                    added: fetched,
                    has_more: state.has_more,
                }
            }
            Err(e) => {
                warn!("Failed to load messages for {}: {}", self.conversation_id, e);
                PageOutcome::Failed
            }
        }
    }

    /// Fetch the next older page and prepend it without reordering what is loaded.
    pub async fn load_older(&self) -> PageOutcome {
        let limit = self.sizes.older;
        let (generation, page) = {
            let mut state = self.lock();
            if state.initial_loading || state.older_loading {
                return PageOutcome::Busy;
            }
            if !state.has_more {
                return PageOutcome::Exhausted;
            }
            state.older_loading = true;
            // Only server-confirmed entries shift the server's paging window.
            let confirmed = state.messages.iter().filter(|m| m.is_confirmed()).count() as u32;
            (state.generation, confirmed / limit.max(1) + 1)
        };

        let result = self.records.fetch_messages(&self.conversation_id, page, limit).await;

        let mut state = self.lock();
        if state.generation != generation {
            debug!("Discarding stale page {} for {}", page, self.conversation_id);
            return PageOutcome::Stale;
        }
        state.older_loading = false;
        match result {
            Ok(mut batch) => {
                batch.sort_by_key(|m| m.created_at);
                let fetched = batch.len();
                let mut merged: Vec<Message> = batch
                    .into_iter()
                    .filter(|m| !state.messages.iter().any(|loaded| loaded.id == m.id))
                    .collect();
                let added = merged.len();
                merged.append(&mut state.messages);
                state.messages = merged;
                state.has_more = fetched >= limit as usize;
                debug!(
                    "Prepended {} older message(s) to {} from page {}",
                    added, self.conversation_id, page
                );
                PageOutcome::Loaded {
                    added,
                    has_more: state.has_more,
                }
            }
            Err(e) => {
                warn!("Failed to load older messages for {}: {}", self.conversation_id, e);
                PageOutcome::Failed
            }
        }
    }

    /// Append a live message. Returns false for other conversations and for
    /// ids already present (e.g. the echo of our own send).
    pub fn apply_incoming(&self, message: &Message) -> bool {
        if message.conversation_id != self.conversation_id {
            return false;
        }
        let mut state = self.lock();
        if state.messages.iter().any(|m| m.id == message.id) {
            debug!("Dropping duplicate message {}", message.id);
            return false;
        }
        state.messages.push(message.clone());
        true
    }

    /// Forget everything; in-flight responses for this generation are ignored.
    pub fn close(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.messages.clear();
        state.unsent_files.clear();
        state.has_more = true;
        state.initial_loading = false;
        state.older_loading = false;
    }

    pub async fn send(&self, content: &str, attachment: Option<LocalFile>) -> SendOutcome {
        if content.trim().is_empty() && attachment.is_none() {
            return SendOutcome::Rejected;
        }
        let temp_id = self.push_placeholder(content, Vec::new());
        self.upload_and_deliver(temp_id, content.to_string(), Vec::new(), attachment)
            .await
    }

    /// Explicit retry of a failed entry: it is replaced by a brand-new send.
    /// A file whose upload failed is uploaded again.
    pub async fn resend(&self, failed_id: &str) -> Option<SendOutcome> {
        let (failed, file) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let index = state
                .messages
                .iter()
                .position(|m| m.id == failed_id && m.status == MessageStatus::Failed)?;
            let failed = &state.messages[index];
            if failed.content.trim().is_empty()
                && failed.attachments.is_empty()
                && !state.unsent_files.contains_key(failed_id)
            {
                return Some(SendOutcome::Rejected);
            }
            let file = state.unsent_files.remove(failed_id);
            (state.messages.remove(index), file)
        };
        let temp_id = self.push_placeholder(&failed.content, failed.attachments.clone());
        Some(
            self.upload_and_deliver(temp_id, failed.content, failed.attachments, file)
                .await,
        )
    }

    async fn upload_and_deliver(
        &self,
        temp_id: String,
        content: String,
        mut attachments: Vec<Attachment>,
        file: Option<LocalFile>,
    ) -> SendOutcome {
        if let Some(file) = file {
            match self.records.upload(&file).await {
                Ok(uploaded) => attachments.push(uploaded),
                Err(e) => {
                    warn!("Upload of {} failed: {}", file.file_name, e);
                    self.fail_upload(&temp_id, file);
                    return SendOutcome::Failed { temp_id };
                }
            }
            self.update_placeholder(&temp_id, |m| m.attachments = attachments.clone());
        }

        self.deliver(temp_id, content, attachments).await
    }

    // The file stays with the failed entry so a retry can upload it.
    fn fail_upload(&self, temp_id: &str, file: LocalFile) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(message) = state.messages.iter_mut().find(|m| m.id == temp_id) {
            message.status = MessageStatus::Failed;
            state.unsent_files.insert(temp_id.to_string(), file);
        }
    }

    fn push_placeholder(&self, content: &str, attachments: Vec<Attachment>) -> String {
        let temp_id = format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4());
        let placeholder = Message {
            id: temp_id.clone(),
            conversation_id: self.conversation_id.clone(),
            sender: SenderRef::User(self.local_user.clone()),
            content: content.to_string(),
            attachments,
            created_at: Utc::now(),
            status: MessageStatus::Sending,
        };
        self.lock().messages.push(placeholder);
        temp_id
    }

    async fn deliver(&self, temp_id: String, content: String, attachments: Vec<Attachment>) -> SendOutcome {
        let request = SendMessage {
            conversation_id: self.conversation_id.clone(),
            content,
            attachments,
        };
        match self.request_send(request).await {
            Ok(mut canonical) => {
                canonical.status = MessageStatus::Sent;
                self.reconcile(&temp_id, canonical.clone());
                SendOutcome::Sent(canonical)
            }
            Err(reason) => {
                warn!("Message {} not sent: {}", temp_id, reason);
                self.mark_failed(&temp_id);
                SendOutcome::Failed { temp_id }
            }
        }
    }

    async fn request_send(&self, request: SendMessage) -> Result<Message, String> {
        let payload = serde_json::to_value(&request).map_err(|e| e.to_string())?;
        let raw = self
            .sink
            .emit_with_ack(names::SEND_MESSAGE, payload)
            .await
            .map_err(|e| e.to_string())?;
        let ack: SendAck = serde_json::from_value(raw)
            .map_err(|e| ChannelError::Codec(e).to_string())?;
        match ack {
            SendAck {
                success: true,
                message: Some(message),
                ..
            } => Ok(message),
            SendAck { error, .. } => Err(error.unwrap_or_else(|| "server rejected the message".to_string())),
        }
    }

    // Replace the placeholder in place. If the server echo already put the
    // canonical entry in the list, the placeholder is just removed.
    fn reconcile(&self, temp_id: &str, canonical: Message) {
        let mut state = self.lock();
        let Some(index) = state.messages.iter().position(|m| m.id == temp_id) else {
            debug!("Placeholder {} no longer in stream, ack ignored", temp_id);
            return;
        };
        if state.messages.iter().any(|m| m.id == canonical.id) {
            state.messages.remove(index);
        } else {
            state.messages[index] = canonical;
        }
    }

    fn mark_failed(&self, temp_id: &str) {
        self.update_placeholder(temp_id, |m| m.status = MessageStatus::Failed);
    }

    fn update_placeholder<F: FnOnce(&mut Message)>(&self, temp_id: &str, update: F) {
        let mut state = self.lock();
        if let Some(message) = state.messages.iter_mut().find(|m| m.id == temp_id) {
            update(message);
        }
    }
}
