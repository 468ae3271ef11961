// Common test utilities for integration tests
// Scriptable stand-ins for the record API and the channel, plus message builders.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::LevelFilter;
use serde_json::{json, Value};

use studyroom::channel::events::{names, SendMessage};
use studyroom::channel::EventSink;
use studyroom::error::{ChannelError, RecordError};
use studyroom::models::{Attachment, Conversation, Message, MessageStatus, SenderRef, UserRef};
use studyroom::records::RecordApi;
use studyroom::stream::draft::LocalFile;

static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn message(id: &str, conversation_id: &str, sender: &str, content: &str, seconds: i64) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender: SenderRef::Id(sender.to_string()),
        content: content.to_string(),
        attachments: Vec::new(),
        created_at: at(seconds),
        status: MessageStatus::Sent,
    }
}

/// `count` messages in `conversation_id`, oldest first, ids `m0..`.
pub fn history(conversation_id: &str, count: usize) -> Vec<Message> {
    (0..count)
        .map(|i| message(&format!("m{}", i), conversation_id, "partner", &format!("msg {}", i), i as i64))
        .collect()
}

pub fn conversation(id: &str, local: &str, partner: &str, unread: u32) -> Conversation {
    let mut conversation = Conversation::new(id, vec![UserRef::new(local), UserRef::new(partner)]);
    conversation.unread_counts.insert(local.to_string(), unread);
    conversation
}

/// In-memory record API with server-style newest-first paging.
#[derive(Default)]
pub struct FakeRecords {
    conversations: Mutex<Vec<Conversation>>,
    history: Mutex<HashMap<String, Vec<Message>>>,
    users: Mutex<Vec<UserRef>>,
    pub fail_list: AtomicBool,
    pub fail_messages: AtomicBool,
    pub fail_upload: AtomicBool,
    fetch_delay: Mutex<Option<Duration>>,
    page_requests: Mutex<Vec<(String, u32, u32)>>,
    read_marks: Mutex<Vec<String>>,
}

impl FakeRecords {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        *self.conversations.lock().unwrap() = conversations;
    }

    pub fn set_history(&self, conversation_id: &str, messages: Vec<Message>) {
        self.history
            .lock()
            .unwrap()
            .insert(conversation_id.to_string(), messages);
    }

    pub fn push_history(&self, message: Message) {
        self.history
            .lock()
            .unwrap()
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
    }

    pub fn set_users(&self, users: Vec<UserRef>) {
        *self.users.lock().unwrap() = users;
    }

    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    pub fn page_requests(&self) -> Vec<(String, u32, u32)> {
        self.page_requests.lock().unwrap().clone()
    }

    pub fn read_marks(&self) -> Vec<String> {
        self.read_marks.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordApi for FakeRecords {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, RecordError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(RecordError::Status(503));
        }
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn fetch_messages(
        &self,
        conversation_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>, RecordError> {
        self.page_requests
            .lock()
            .unwrap()
            .push((conversation_id.to_string(), page, limit));
        let delay = *self.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_messages.load(Ordering::SeqCst) {
            return Err(RecordError::Status(500));
        }

        let all = self
            .history
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        let skip = ((page.max(1) - 1) * limit) as usize;
        if skip >= all.len() {
            return Ok(Vec::new());
        }
        let end = all.len() - skip;
        let start = end.saturating_sub(limit as usize);
        Ok(all[start..end].to_vec())
    }

    async fn create_conversation(&self, receiver_id: &str) -> Result<Conversation, RecordError> {
        let mut conversations = self.conversations.lock().unwrap();
        if let Some(existing) = conversations
            .iter()
            .find(|c| c.participants.iter().any(|p| p.id == receiver_id))
        {
            return Ok(existing.clone());
        }
        let created = Conversation::new(
            format!("conv-{}", receiver_id),
            vec![UserRef::new("me"), UserRef::new(receiver_id)],
        );
        conversations.push(created.clone());
        Ok(created)
    }

    async fn search_users(&self, query: &str) -> Result<Vec<UserRef>, RecordError> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.display_name().to_lowercase().contains(&query.to_lowercase()))
            .cloned()
            .collect())
    }

    async fn upload(&self, file: &LocalFile) -> Result<Attachment, RecordError> {
        if self.fail_upload.load(Ordering::SeqCst) {
            return Err(RecordError::Status(413));
        }
        Ok(Attachment {
            url: format!("/uploads/{}", file.file_name),
            original_name: file.file_name.clone(),
        })
    }

    async fn mark_read(&self, conversation_id: &str) -> Result<(), RecordError> {
        self.read_marks.lock().unwrap().push(conversation_id.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Acknowledge with a canonical message (`srv-N`).
    Accept,
    /// `{success: false}`
    Reject,
    /// The channel is down.
    Offline,
}

type AckHook = Box<dyn Fn(&Message) + Send + Sync>;

/// Records everything emitted and answers `send_message` acks as scripted.
pub struct RecordingSink {
    local_user: String,
    mode: Mutex<AckMode>,
    emitted: Mutex<Vec<(String, Value)>>,
    next_id: AtomicU64,
    before_ack: Mutex<Option<AckHook>>,
}

impl RecordingSink {
    pub fn new(local_user: &str, mode: AckMode) -> Arc<Self> {
        Arc::new(Self {
            local_user: local_user.to_string(),
            mode: Mutex::new(mode),
            emitted: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            before_ack: Mutex::new(None),
        })
    }

    pub fn set_mode(&self, mode: AckMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Runs with the canonical message right before the ack is returned.
    pub fn before_ack<F: Fn(&Message) + Send + Sync + 'static>(&self, hook: F) {
        *self.before_ack.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.emitted.lock().unwrap().clone()
    }

    pub fn emitted_named(&self, event: &str) -> Vec<Value> {
        self.emitted()
            .into_iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload)
            .collect()
    }

    /// `(conversationId, isTyping)` for every typing notice, in order.
    pub fn typing_notices(&self) -> Vec<(String, bool)> {
        self.emitted_named(names::TYPING)
            .into_iter()
            .map(|payload| {
                (
                    payload["conversationId"].as_str().unwrap_or_default().to_string(),
                    payload["isTyping"].as_bool().unwrap_or_default(),
                )
            })
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        if *self.mode.lock().unwrap() == AckMode::Offline {
            return Err(ChannelError::NotConnected);
        }
        self.emitted.lock().unwrap().push((event.to_string(), payload));
        Ok(())
    }

    async fn emit_with_ack(&self, event: &str, payload: Value) -> Result<Value, ChannelError> {
        let mode = *self.mode.lock().unwrap();
        if mode == AckMode::Offline {
            return Err(ChannelError::NotConnected);
        }
        self.emitted.lock().unwrap().push((event.to_string(), payload.clone()));
        if mode == AckMode::Reject {
            return Ok(json!({ "success": false, "error": "conversation closed" }));
        }

        let request: SendMessage = serde_json::from_value(payload)?;
        let canonical = Message {
            id: format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            conversation_id: request.conversation_id,
            sender: SenderRef::Id(self.local_user.clone()),
            content: request.content,
            attachments: request.attachments,
            created_at: Utc::now(),
            status: MessageStatus::Sent,
        };
        if let Some(hook) = self.before_ack.lock().unwrap().as_ref() {
            hook(&canonical);
        }
        Ok(json!({ "success": true, "message": canonical }))
    }
}

/// Poll `check` until it holds or roughly two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
