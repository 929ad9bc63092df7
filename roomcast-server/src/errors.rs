use roomcast_core::FrameError;

pub use roomcast_core::{AckError, ACK_TIMEOUT_CODE};

/// Error type for sending a frame to a single socket.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("error encoding frame: {0}")]
    Encode(#[from] FrameError),

    /// The socket is closing or closed.
    #[error("socket is closed")]
    Closed,

    /// The per-socket outbound buffer is full. The frame is dropped, the
    /// connection stays up.
    #[error("socket send buffer is full")]
    BufferFull,
}

/// Error type for broadcast operations. Individual socket failures are
/// collected so one slow or closed receiver does not abort the fan-out.
#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("error encoding frame: {0}")]
    Encode(#[from] FrameError),

    #[error("sending errors: {0:?}")]
    Send(Vec<SendError>),
}

impl From<Vec<SendError>> for BroadcastError {
    fn from(errs: Vec<SendError>) -> Self {
        Self::Send(errs)
    }
}
