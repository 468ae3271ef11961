// Composition root
// Builds every store, wires them to the channel, and exposes the commands
// a frontend drives. Stores never reach into each other directly.

use log::{debug, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::channel::events::{names, JoinConversation};
use crate::channel::registry::decode;
use crate::channel::{ConnectionManager, ConnectionState, Credential, EventSink, SubscriptionId, Transport};
use crate::config::ClientConfig;
use crate::conversations::{ApplyOutcome, ConversationStore};
use crate::error::RecordError;
use crate::models::{Conversation, ConversationRef, Message, UserRef};
use crate::presence::PresenceTracker;
use crate::records::RecordApi;
use crate::stream::draft::{AttachmentDraft, LocalFile};
use crate::stream::{MessageStream, PageOutcome, SendOutcome};
use crate::typing::TypingCoordinator;
use crate::windows::{WindowManager, WindowStore};

struct OpenConversation {
    stream: MessageStream,
    draft: AttachmentDraft,
}

type OpenMap = Arc<Mutex<HashMap<String, OpenConversation>>>;

fn lock_open(open: &OpenMap) -> MutexGuard<'_, HashMap<String, OpenConversation>> {
    open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ChatClient {
    local_user: UserRef,
    config: ClientConfig,
    connection: ConnectionManager,
    records: Arc<dyn RecordApi>,
    presence: PresenceTracker,
    typing: TypingCoordinator,
    conversations: ConversationStore,
    windows: Arc<WindowManager>,
    open: OpenMap,
    focused: Mutex<Option<String>>,
    subscriptions: Mutex<Vec<(&'static str, SubscriptionId)>>,
    rejoin_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    pub fn new(
        local_user: UserRef,
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        records: Arc<dyn RecordApi>,
        window_store: Arc<dyn WindowStore>,
    ) -> Self {
        let connection = ConnectionManager::new(transport, config.reconnect.clone(), config.ack_timeout());
        let sink: Arc<dyn EventSink> = Arc::new(connection.clone());

        let presence = PresenceTracker::new();
        presence.attach(connection.registry());

        let typing = TypingCoordinator::new(sink, config.typing_idle());
        typing.attach(connection.registry());

        let conversations = ConversationStore::new(local_user.id.clone(), records.clone());
        let windows = Arc::new(WindowManager::restore(window_store, Arc::new(conversations.clone())));

        let client = Self {
            local_user,
            config,
            connection,
            records,
            presence,
            typing,
            conversations,
            windows,
            open: Arc::new(Mutex::new(HashMap::new())),
            focused: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            rejoin_task: Mutex::new(None),
        };
        client.register_message_handlers();
        client
    }

    // Two independent subscribers on `receive_message`: the conversation
    // list and the open message streams.
    fn register_message_handlers(&self) {
        let conversations = self.conversations.clone();
        let typing = self.typing.clone();
        let list_id = self
            .connection
            .register_callback(names::RECEIVE_MESSAGE, move |payload: &Value| {
                let Some(message) = decode::<Message>(names::RECEIVE_MESSAGE, payload) else {
                    return;
                };
                if message.sender_id() != conversations.local_user() {
                    typing.clear_remote(&message.conversation_id);
                }
                match conversations.apply_incoming_message(&message) {
                    ApplyOutcome::UnknownConversation => {
                        info!("Message for a new conversation {}, reloading list", message.conversation_id);
                        // The server list already counts this message.
                        let store = conversations.clone();
                        tokio::spawn(async move {
                            store.load_conversations().await;
                        });
                    }
                    ApplyOutcome::Counted | ApplyOutcome::Read | ApplyOutcome::SelfAuthored => {}
                }
            });

        let open = self.open.clone();
        let stream_id = self
            .connection
            .register_callback(names::RECEIVE_MESSAGE, move |payload: &Value| {
                let Some(message) = decode::<Message>(names::RECEIVE_MESSAGE, payload) else {
                    return;
                };
                if let Some(entry) = lock_open(&open).get(&message.conversation_id) {
                    entry.stream.apply_incoming(&message);
                }
            });

        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|p| p.into_inner());
        subscriptions.push((names::RECEIVE_MESSAGE, list_id));
        subscriptions.push((names::RECEIVE_MESSAGE, stream_id));
    }

    pub fn local_user(&self) -> &UserRef {
        &self.local_user
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn typing(&self) -> &TypingCoordinator {
        &self.typing
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn windows(&self) -> &WindowManager {
        &self.windows
    }

    pub fn focused(&self) -> Option<String> {
        self.focused.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Connect, load the conversation list, and bring restored panels back with fresh history.
    pub async fn start(&self, credential: Credential) {
        self.watch_reconnects();
        self.connection.connect(credential);

        if !self.conversations.load_conversations().await {
            warn!("Starting with an empty conversation list");
        }

        let active = self.windows.state().active;
        for conversation in &active {
            self.stream_for(&conversation.id).open().await;
        }
        if let Some(last) = active.last() {
            self.focus(Some(last.id.clone()));
        }
    }

    // Every time the channel comes (back) up, rejoin the open conversations.
    fn watch_reconnects(&self) {
        let mut state_rx = self.connection.watch_state();
        let connection = self.connection.clone();
        let windows = self.windows.clone();
        let task = tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow_and_update();
                if state != ConnectionState::Connected {
                    continue;
                }
                for conversation in windows.state().active {
                    join(&connection, &conversation.id);
                }
            }
        });
        if let Some(previous) = self.rejoin_task.lock().unwrap_or_else(|p| p.into_inner()).replace(task) {
            previous.abort();
        }
    }

    fn stream_for(&self, conversation_id: &str) -> MessageStream {
        let mut open = lock_open(&self.open);
        open.entry(conversation_id.to_string())
            .or_insert_with(|| OpenConversation {
                stream: MessageStream::new(
                    conversation_id,
                    self.local_user.clone(),
                    self.records.clone(),
                    Arc::new(self.connection.clone()),
                    self.config.page_sizes(),
                ),
                draft: AttachmentDraft::new(),
            })
            .stream
            .clone()
    }

    pub fn stream(&self, conversation_id: &str) -> Option<MessageStream> {
        lock_open(&self.open).get(conversation_id).map(|entry| entry.stream.clone())
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.stream(conversation_id)
            .map(|stream| stream.messages())
            .unwrap_or_default()
    }

    /// Make `conversation_id` the one being read, or none.
    pub fn focus(&self, conversation_id: Option<String>) {
        self.conversations.set_reading(conversation_id.clone());
        if let Some(id) = &conversation_id {
            if self.conversations.mark_read(id) > 0 {
                self.sync_read(id);
            }
        }
        self.typing.switch_conversation(conversation_id.clone());
        *self.focused.lock().unwrap_or_else(|p| p.into_inner()) = conversation_id;
    }

    fn sync_read(&self, conversation_id: &str) {
        spawn_read_sync(self.records.clone(), conversation_id.to_string());
    }

    /// Open a panel for `conversation`. The first page is fetched when the
    /// panel was not already showing history.
    pub async fn open_conversation(&self, conversation: ConversationRef) -> Option<PageOutcome> {
        let id = conversation.id.clone();
        let had_unread = self.conversations.unread_for(&id) > 0;
        let newly_active = self.windows.open(conversation);
        if had_unread {
            self.sync_read(&id);
        }
        self.focus(Some(id.clone()));
        join(&self.connection, &id);

        let stream = self.stream_for(&id);
        if newly_active || stream.is_empty() {
            Some(stream.open().await)
        } else {
            None
        }
    }

    /// Open by id using the title known to the conversation list.
    pub async fn open_conversation_by_id(&self, conversation_id: &str) -> Option<PageOutcome> {
        let reference = match self.conversations.get(conversation_id) {
            Some(conversation) => conversation.to_ref(&self.local_user.id),
            None => ConversationRef::new(conversation_id, conversation_id),
        };
        self.open_conversation(reference).await
    }

    pub async fn start_conversation(&self, receiver_id: &str) -> Result<Conversation, RecordError> {
        let conversation = self.conversations.start_conversation(receiver_id).await?;
        self.open_conversation(conversation.to_ref(&self.local_user.id)).await;
        Ok(conversation)
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<UserRef>, RecordError> {
        self.conversations.search_users(query).await
    }

    pub fn minimize_conversation(&self, conversation: ConversationRef) {
        let id = conversation.id.clone();
        self.windows.minimize(conversation);
        self.release(&id);
    }

    pub fn close_conversation(&self, conversation_id: &str) {
        self.windows.close(conversation_id);
        self.release(conversation_id);
    }

    // History is dropped with the panel and re-fetched on the next open.
    fn release(&self, conversation_id: &str) {
        if let Some(entry) = lock_open(&self.open).remove(conversation_id) {
            entry.stream.close();
        }
        if self.focused().as_deref() == Some(conversation_id) {
            self.focus(None);
        }
    }

    pub fn keystroke(&self) {
        self.typing.keystroke();
    }

    /// Hold a file for the focused conversation until the next send.
    pub fn attach_file(&self, path: impl AsRef<Path>) -> io::Result<LocalFile> {
        let focused = self
            .focused()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no conversation is focused"))?;
        let file = LocalFile::from_path(path)?;
        if let Some(entry) = lock_open(&self.open).get_mut(&focused) {
            entry.draft.select(file.clone());
        }
        Ok(file)
    }

    pub fn attachment_preview(&self) -> Option<LocalFile> {
        let focused = self.focused()?;
        lock_open(&self.open)
            .get(&focused)
            .and_then(|entry| entry.draft.preview().cloned())
    }

    /// Send to the focused conversation. `None` when nothing is focused.
    pub async fn send_message(&self, content: &str) -> Option<SendOutcome> {
        let focused = self.focused()?;
        let (stream, attachment) = {
            let mut open = lock_open(&self.open);
            let entry = open.get_mut(&focused)?;
            (entry.stream.clone(), entry.draft.take())
        };
        self.typing.stop();

        let outcome = stream.send(content, attachment).await;
        if let SendOutcome::Sent(message) = &outcome {
            self.conversations.apply_incoming_message(message);
        }
        Some(outcome)
    }

    pub async fn resend(&self, failed_id: &str) -> Option<SendOutcome> {
        let stream = self.stream(&self.focused()?)?;
        let outcome = stream.resend(failed_id).await?;
        if let SendOutcome::Sent(message) = &outcome {
            self.conversations.apply_incoming_message(message);
        }
        Some(outcome)
    }

    pub async fn load_older(&self) -> Option<PageOutcome> {
        let stream = self.stream(&self.focused()?)?;
        Some(stream.load_older().await)
    }

    pub fn shutdown(&self) {
        self.typing.teardown();
        if let Some(task) = self.rejoin_task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
        self.connection.disconnect();
        info!("Chat client shut down");
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(|p| p.into_inner()));
        for (event, id) in subscriptions {
            self.connection.unregister_callback(event, id);
        }
        self.presence.detach(self.connection.registry());
        self.typing.detach(self.connection.registry());
        if let Some(task) = self.rejoin_task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
    }
}

// Server-side read sync is best effort and never blocks the caller.
fn spawn_read_sync(records: Arc<dyn RecordApi>, conversation_id: String) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    runtime.spawn(async move {
        if let Err(e) = records.mark_read(&conversation_id).await {
            debug!("Read sync for {} failed: {}", conversation_id, e);
        }
    });
}

fn join(connection: &ConnectionManager, conversation_id: &str) {
    let payload = match serde_json::to_value(JoinConversation {
        conversation_id: conversation_id.to_string(),
    }) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Could not encode join for {}: {}", conversation_id, e);
            return;
        }
    };
    if let Err(e) = connection.emit(names::JOIN_CONVERSATION, payload) {
        debug!("Join for {} deferred until connected: {}", conversation_id, e);
    }
}
