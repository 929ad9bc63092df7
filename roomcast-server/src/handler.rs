//! Handler and middleware signatures, and the one-shot ack reply handle.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use roomcast_core::{ErrorPayload, Frame};
use serde::Serialize;
use serde_json::Value;

use crate::errors::SendError;
use crate::socket::{DisconnectReason, Socket};

/// An event handler. Receives the sender socket, the decoded payload and,
/// when the frame requested an acknowledgement, an [`AckSender`].
pub type MessageHandler = Arc<dyn Fn(Arc<Socket>, Value, Option<AckSender>) + Send + Sync>;

/// Runs before the handler for every inbound event on the namespace.
/// Returning `Err` rejects the event: the error surfaces to the sender as an
/// ERROR frame naming the event, and the handler is not called.
pub type Middleware =
    Arc<dyn Fn(&Arc<Socket>, &str, &Value) -> Result<(), ErrorPayload> + Send + Sync>;

/// Called when a socket finishes attaching to the namespace.
pub type ConnectHandler = Arc<dyn Fn(Arc<Socket>) + Send + Sync>;

/// Called when a socket detaches from the namespace, with the reason.
pub type DisconnectHandler = Arc<dyn Fn(Arc<Socket>, DisconnectReason) + Send + Sync>;

/// One-shot handle for answering an event that requested an
/// acknowledgement.
///
/// Calling [`send`](Self::send) more than once is a no-op after the first.
/// Never calling it simply lets the sender's timeout fire; that is not an
/// error on this side.
pub struct AckSender {
    socket: Arc<Socket>,
    ack_id: u32,
    used: AtomicBool,
}

impl AckSender {
    pub(crate) fn new(socket: Arc<Socket>, ack_id: u32) -> Self {
        Self {
            socket,
            ack_id,
            used: AtomicBool::new(false),
        }
    }

    /// The correlation id this handle answers.
    pub fn id(&self) -> u32 {
        self.ack_id
    }

    /// Sends the acknowledgement back to the event sender.
    pub fn send<T: Serialize>(&self, data: T) -> Result<(), SendError> {
        if self.used.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let value = serde_json::to_value(data).map_err(roomcast_core::FrameError::from)?;
        let frame = Frame::ack(self.socket.ns_path().to_owned(), self.ack_id, value);
        self.socket.send_frame(&frame)
    }
}

impl std::fmt::Debug for AckSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckSender")
            .field("sid", &self.socket.id)
            .field("ack_id", &self.ack_id)
            .field("used", &self.used)
            .finish()
    }
}
