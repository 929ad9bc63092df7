use roomcast_core::FrameError;

pub use roomcast_core::{AckError, ACK_TIMEOUT_CODE};

/// Error type for the client surface.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The WebSocket handshake failed.
    #[error("connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    /// The handshake did not complete within `connect_timeout`.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The client is terminally closed (user disconnect or exhausted
    /// reconnect attempts).
    #[error("client is closed")]
    Closed,

    /// The client is already connected or connecting.
    #[error("client is already running")]
    AlreadyRunning,

    #[error("error encoding frame: {0}")]
    Encode(#[from] FrameError),
}
