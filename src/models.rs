// Shared data model for conversations, messages and their participants.
// Field names follow the JSON the record collaborator and the channel speak (camelCase).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl UserRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            avatar: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A message sender arrives either populated or as a bare user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SenderRef {
    User(UserRef),
    Id(String),
}

impl SenderRef {
    pub fn id(&self) -> &str {
        match self {
            SenderRef::User(user) => &user.id,
            SenderRef::Id(id) => id,
        }
    }
}

impl From<UserRef> for SenderRef {
    fn from(user: UserRef) -> Self {
        SenderRef::User(user)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    pub original_name: String,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending, // Optimistic entry, waiting for the server ack
    #[default]
    Sent,    // Canonical server entry
    Failed,  // Send or upload failed; stays visible until resent
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(alias = "_id")]
    pub id: String,
    pub conversation_id: String,
    pub sender: SenderRef,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: MessageStatus,
}

impl Message {
    pub fn sender_id(&self) -> &str {
        self.sender.id()
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == MessageStatus::Sent
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub participants: Vec<UserRef>,
    #[serde(default)]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub unread_counts: HashMap<String, u32>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, participants: Vec<UserRef>) -> Self {
        Self {
            id: id.into(),
            participants,
            last_message: None,
            unread_counts: HashMap::new(),
        }
    }

    pub fn unread_for(&self, user_id: &str) -> u32 {
        self.unread_counts.get(user_id).copied().unwrap_or(0)
    }

    /// The first participant who is not `local_user_id`.
    pub fn partner(&self, local_user_id: &str) -> Option<&UserRef> {
        self.participants.iter().find(|p| p.id != local_user_id)
    }

    pub fn to_ref(&self, local_user_id: &str) -> ConversationRef {
        ConversationRef {
            id: self.id.clone(),
            title: self
                .partner(local_user_id)
                .map(|p| p.display_name().to_string())
                .unwrap_or_else(|| self.id.clone()),
        }
    }
}

/// What the window lists hold and persist: enough to redraw a panel before history loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
}

impl ConversationRef {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }
}
