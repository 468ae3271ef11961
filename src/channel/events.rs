// Event names and payloads carried over the channel

use serde::{Deserialize, Serialize};

use crate::models::{Attachment, Message};

pub mod names {
    pub const JOIN_CONVERSATION: &str = "join_conversation";
    pub const SEND_MESSAGE: &str = "send_message";
    pub const RECEIVE_MESSAGE: &str = "receive_message";
    pub const TYPING: &str = "typing";
    pub const USER_TYPING: &str = "user_typing";
    pub const GET_ONLINE_USERS: &str = "get_online_users";
    pub const USER_ONLINE: &str = "user_online";
    pub const USER_OFFLINE: &str = "user_offline";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinConversation {
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub conversation_id: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

/// Ack payload for `send_message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAck {
    pub success: bool,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Used in both directions: `typing` (ours) and `user_typing` (partner's).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub conversation_id: String,
    pub is_typing: bool,
}
