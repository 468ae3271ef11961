use thiserror::Error;

/// Failures of the event channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("channel endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("credential rejected by the channel server")]
    Unauthorized,
    #[error("timed out waiting for acknowledgement")]
    AckTimeout,
    #[error("channel closed before the acknowledgement arrived")]
    Closed,
    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Failures talking to the record collaborator.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered with status {0}")]
    Status(u16),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),
}
