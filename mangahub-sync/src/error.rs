//! Error type shared by every hub, the bridge and the reconnecting client.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("{0} peer is not connected")]
    NotConnected(&'static str),

    #[error("Outbound queue is full")]
    QueueFull,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out while {0}")]
    Timeout(&'static str),

    #[error("Reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Hub has shut down")]
    HubClosed,
}

impl SyncError {
    /// True when the owning consumer should stop retrying.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ReconnectExhausted { .. })
    }
}
