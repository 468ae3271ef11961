// Typing indicators
// Local side: a two-state machine (idle/typing) per open conversation with a
// cancellable trailing timer. Remote side: which conversations currently have
// a partner typing, fed by `user_typing` events.

use log::debug;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::channel::events::{names, TypingNotice};
use crate::channel::registry::{decode, EventRegistry, SubscriptionId};
use crate::channel::EventSink;

pub const DEFAULT_IDLE_AFTER: Duration = Duration::from_secs(1);

enum LocalTyping {
    Idle,
    Typing { timer: JoinHandle<()> },
}

struct TypingInner {
    conversation: Option<String>,
    local: LocalTyping,
    // Bumped whenever the pending timer is superseded.
    epoch: u64,
    partner_typing: HashSet<String>,
    subscription: Option<SubscriptionId>,
}

#[derive(Clone)]
pub struct TypingCoordinator {
    sink: Arc<dyn EventSink>,
    idle_after: Duration,
    inner: Arc<Mutex<TypingInner>>,
}

impl TypingCoordinator {
    pub fn new(sink: Arc<dyn EventSink>, idle_after: Duration) -> Self {
        Self {
            sink,
            idle_after,
            inner: Arc::new(Mutex::new(TypingInner {
                conversation: None,
                local: LocalTyping::Idle,
                epoch: 0,
                partner_typing: HashSet::new(),
                subscription: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TypingInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn attach(&self, registry: &EventRegistry) {
        self.detach(registry);
        let coordinator = self.clone();
        let id = registry.register(names::USER_TYPING, move |payload: &Value| {
            if let Some(notice) = decode::<TypingNotice>(names::USER_TYPING, payload) {
                coordinator.apply_remote(notice);
            }
        });
        self.lock().subscription = Some(id);
    }

    pub fn detach(&self, registry: &EventRegistry) {
        if let Some(id) = self.lock().subscription.take() {
            registry.unregister(names::USER_TYPING, id);
        }
    }

    pub fn conversation(&self) -> Option<String> {
        self.lock().conversation.clone()
    }

    pub fn is_typing(&self) -> bool {
        matches!(self.lock().local, LocalTyping::Typing { .. })
    }

    /// Must be called from within a tokio runtime: it arms the idle timer.
    pub fn keystroke(&self) {
        let mut inner = self.lock();
        let Some(conversation) = inner.conversation.clone() else {
            debug!("Keystroke with no open conversation ignored");
            return;
        };

        let starting = match std::mem::replace(&mut inner.local, LocalTyping::Idle) {
            LocalTyping::Idle => true,
            LocalTyping::Typing { timer } => {
                timer.abort();
                false
            }
        };
        inner.epoch += 1;
        let timer = self.arm_idle_timer(conversation.clone(), inner.epoch);
        inner.local = LocalTyping::Typing { timer };
        drop(inner);

        if starting {
            self.send(&conversation, true);
        }
    }

    /// Change the open conversation. A pending typing state is stopped first
    /// so it never leaks into the next conversation.
    pub fn switch_conversation(&self, conversation: Option<String>) {
        let stopped = {
            let mut inner = self.lock();
            if inner.conversation == conversation {
                return;
            }
            let stopped = Self::stop_local(&mut inner);
            inner.conversation = conversation;
            inner.partner_typing.clear();
            stopped
        };
        if let Some(previous) = stopped {
            self.send(&previous, false);
        }
    }

    /// End local typing now (e.g. the message was sent) without waiting for the timer.
    pub fn stop(&self) {
        let stopped = Self::stop_local(&mut self.lock());
        if let Some(conversation) = stopped {
            self.send(&conversation, false);
        }
    }

    pub fn teardown(&self) {
        self.switch_conversation(None);
    }

    pub fn is_partner_typing(&self, conversation_id: &str) -> bool {
        self.lock().partner_typing.contains(conversation_id)
    }

    /// A message from the partner ends their typing indicator.
    pub fn clear_remote(&self, conversation_id: &str) {
        self.lock().partner_typing.remove(conversation_id);
    }

    pub fn apply_remote(&self, notice: TypingNotice) {
        let mut inner = self.lock();
        if notice.is_typing {
            inner.partner_typing.insert(notice.conversation_id);
        } else {
            inner.partner_typing.remove(&notice.conversation_id);
        }
    }

    fn stop_local(inner: &mut TypingInner) -> Option<String> {
        match std::mem::replace(&mut inner.local, LocalTyping::Idle) {
            LocalTyping::Idle => None,
            LocalTyping::Typing { timer } => {
                timer.abort();
                inner.epoch += 1;
                inner.conversation.clone()
            }
        }
    }

    fn arm_idle_timer(&self, conversation: String, epoch: u64) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(coordinator.idle_after).await;
            coordinator.expire(&conversation, epoch);
        })
    }

    fn expire(&self, conversation: &str, epoch: u64) {
        {
            let mut inner = self.lock();
            if inner.epoch != epoch || !matches!(inner.local, LocalTyping::Typing { .. }) {
                return;
            }
            inner.local = LocalTyping::Idle;
        }
        self.send(conversation, false);
    }

    fn send(&self, conversation_id: &str, is_typing: bool) {
        let notice = TypingNotice {
            conversation_id: conversation_id.to_string(),
            is_typing,
        };
        let payload = match serde_json::to_value(&notice) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("Could not encode typing notice: {}", e);
                return;
            }
        };
        if let Err(e) = self.sink.emit(names::TYPING, payload) {
            debug!("Typing notice for {} not sent: {}", conversation_id, e);
        }
    }
}
