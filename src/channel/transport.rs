// Transport abstraction under the connection manager.
// A transport only knows how to open a link; lifecycle, retries and
// dispatch belong to the ConnectionManager.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ChannelError;

/// What the channel server needs to accept a connection.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub user_id: String,
    pub token: String,
}

impl Credential {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }
}

// Never print the token.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// One JSON text frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    #[serde(rename_all = "camelCase")]
    Event {
        event: String,
        #[serde(default)]
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Ack {
        ack_id: u64,
        #[serde(default)]
        payload: Value,
    },
}

impl Frame {
    pub fn event(event: &str, payload: Value) -> Self {
        Frame::Event {
            event: event.to_string(),
            payload,
            ack_id: None,
        }
    }

    pub fn encode(&self) -> Result<String, ChannelError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ChannelError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// An open link. Dropping `outbound` closes our side; `inbound` yields
/// `None` once the peer or the network closes.
pub struct TransportLink {
    pub outbound: mpsc::Sender<Frame>,
    pub inbound: mpsc::Receiver<Frame>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, credential: &Credential) -> Result<TransportLink, ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_wire_shape() {
        let frame = Frame::Event {
            event: "send_message".to_string(),
            payload: json!({"conversationId": "c1"}),
            ack_id: Some(7),
        };
        let text = frame.encode().unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(raw["type"], "event");
        assert_eq!(raw["ackId"], 7);
        assert_eq!(raw["payload"]["conversationId"], "c1");

        let ack = Frame::decode(r#"{"type":"ack","ackId":7,"payload":{"success":true}}"#).unwrap();
        assert_eq!(
            ack,
            Frame::Ack {
                ack_id: 7,
                payload: json!({"success": true})
            }
        );
    }

    #[test]
    fn test_credential_debug_hides_token() {
        let credential = Credential::new("u1", "secret-token");
        assert!(!format!("{:?}", credential).contains("secret-token"));
    }
}
