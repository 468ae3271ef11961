// In-process transport. The MemoryServer side receives one MemoryPeer per
// successful open, which is handy for embedding and for driving the client in tests.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::transport::{Credential, Frame, Transport, TransportLink};
use crate::error::ChannelError;

const FRAME_BUFFER: usize = 100;

pub struct MemoryTransport {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    rejected_tokens: Arc<Mutex<HashSet<String>>>,
}

pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
    rejected_tokens: Arc<Mutex<HashSet<String>>>,
}

/// Server end of one link.
pub struct MemoryPeer {
    pub credential: Credential,
    pub to_client: mpsc::Sender<Frame>,
    pub from_client: mpsc::Receiver<Frame>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryServer) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let rejected_tokens = Arc::new(Mutex::new(HashSet::new()));
        (
            MemoryTransport {
                accept_tx,
                rejected_tokens: rejected_tokens.clone(),
            },
            MemoryServer {
                accept_rx,
                rejected_tokens,
            },
        )
    }
}

impl MemoryServer {
    /// Wait for the next client link.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Future opens with this token fail with `Unauthorized`.
    pub fn reject_token(&self, token: &str) {
        self.rejected_tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(token.to_string());
    }
}

impl MemoryPeer {
    pub async fn push(&self, event: &str, payload: serde_json::Value) -> bool {
        self.to_client.send(Frame::event(event, payload)).await.is_ok()
    }

    pub async fn ack(&self, ack_id: u64, payload: serde_json::Value) -> bool {
        self.to_client.send(Frame::Ack { ack_id, payload }).await.is_ok()
    }

    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, credential: &Credential) -> Result<TransportLink, ChannelError> {
        let rejected = self
            .rejected_tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&credential.token);
        if rejected {
            return Err(ChannelError::Unauthorized);
        }

        let (out_tx, out_rx) = mpsc::channel(FRAME_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(FRAME_BUFFER);
        let peer = MemoryPeer {
            credential: credential.clone(),
            to_client: in_tx,
            from_client: out_rx,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| ChannelError::Unreachable("memory server dropped".to_string()))?;

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
