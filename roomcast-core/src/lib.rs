//! Shared wire protocol for the roomcast messaging broker.
//!
//! This crate holds everything the server and the client must agree on
//! bit-for-bit: the [`Frame`] model, the binary [`codec`] (including DEFLATE
//! compression and optional AES-256-CBC payload encryption) and the
//! [`SocketId`] type. It contains no I/O; both runtimes feed it byte buffers.

pub mod ack;
pub mod codec;
pub mod errors;
pub mod frame;
pub mod id;

pub use ack::{AckError, AckFuture, AckResult, ACK_TIMEOUT_CODE};
pub use codec::{decode, encode, CodecConfig};
pub use errors::FrameError;
pub use frame::{ErrorPayload, Frame, FrameType, Payload};
pub use id::SocketId;

/// Reserved event names that application code may not register handlers for.
///
/// They are either synthesised by the runtimes (`connected`, `disconnected`,
/// `__rate-limited__`) or reported through dedicated frame types.
pub const RESERVED_EVENTS: &[&str] = &[
    "connected",
    "disconnected",
    "error",
    "__rate-limited__",
    "__heartbeat__",
    "__heartbeat-ack__",
];

/// Returns whether `event` is reserved for the runtime.
pub fn is_reserved_event(event: &str) -> bool {
    RESERVED_EVENTS.contains(&event)
}

/// Event name used to inform a sender that a frame was dropped by the
/// rate limiter.
pub const RATE_LIMITED_EVENT: &str = "__rate-limited__";
