use thiserror::Error;

use crate::websocket::ConnectionId;

/// Error taxonomy for the broadcast hub.
///
/// Per-connection and per-message variants are always recovered locally by the
/// component that raised them; they exist so that log lines and tests can name
/// the failure precisely.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("connection rejected: {0}")]
    ConnectionRejected(String),

    #[error("invalid topic request: {0}")]
    InvalidTopicRequest(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("heartbeat timeout for connection {0}")]
    HeartbeatTimeout(ConnectionId),

    #[error("relay decode error on channel '{channel}': {reason}")]
    RelayDecodeError { channel: String, reason: String },

    #[error("broadcast to '{topic}' failed for {failed} of {attempted} recipients")]
    PartialBroadcastFailure {
        topic: String,
        failed: usize,
        attempted: usize,
    },

    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HubError {
    pub fn relay_decode(channel: &str, reason: impl Into<String>) -> Self {
        Self::RelayDecodeError {
            channel: channel.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
