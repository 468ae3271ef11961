// WebSocket transport: one JSON text message per frame

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

use super::transport::{Credential, Frame, Transport, TransportLink};
use crate::error::ChannelError;

const FRAME_BUFFER: usize = 100;

pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

fn map_ws_error(err: WsError) -> ChannelError {
    match err {
        WsError::Http(response) if response.status().as_u16() == 401 || response.status().as_u16() == 403 => {
            ChannelError::Unauthorized
        }
        other => ChannelError::Unreachable(other.to_string()),
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, credential: &Credential) -> Result<TransportLink, ChannelError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::Unreachable(format!("invalid channel url '{}': {}", self.url, e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.token))
            .map_err(|_| ChannelError::Unauthorized)?;
        request.headers_mut().insert("Authorization", bearer);

        debug!("Opening WebSocket channel to {}", self.url);
        let (ws_stream, _response) = connect_async(request).await.map_err(map_ws_error)?;
        let (mut sink, mut stream) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(FRAME_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<Frame>(FRAME_BUFFER);

        // Writer: ends when the manager drops its sender, then closes the socket.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode outbound frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    warn!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: ends on close, error, or when nobody listens any more.
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => match Frame::decode(&text) {
                        Ok(frame) => {
                            if in_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Ignoring undecodable frame: {}", e),
                    },
                    Ok(WsMessage::Close(_)) => {
                        debug!("Server closed the WebSocket channel");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
