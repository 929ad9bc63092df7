use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SocketId;

/// The single supported protocol version. Frames carrying any other version
/// byte are rejected as `frame_invalid`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum payload length in bytes, after decompression.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Payload is replaced by its DEFLATE stream above this many bytes unless
/// the caller overrides the threshold.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Default DEFLATE level, valid range 1..=9.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Flag bits of the third header byte. Bits 0..=3 are reserved and must be
/// zero on the wire.
pub mod flags {
    pub const COMPRESSED: u8 = 0b1000_0000;
    pub const ENCRYPTED: u8 = 0b0100_0000;
    pub const ACK_REQUESTED: u8 = 0b0010_0000;
    pub const BINARY: u8 = 0b0001_0000;
    pub const RESERVED_MASK: u8 = 0b0000_1111;
}

/// | Type          | ID  | Usage                                                     |
/// |---------------|-----|-----------------------------------------------------------|
/// | CONNECT       | 0   | Sent by the server once a socket is bound to a namespace. |
/// | DISCONNECT    | 1   | Graceful namespace detach, either direction.              |
/// | EVENT         | 2   | Application event, optionally requesting an ack.          |
/// | ACK           | 3   | Reply correlated to an EVENT by ack id.                   |
/// | ERROR         | 4   | Protocol error report, payload is an [`ErrorPayload`].    |
/// | HEARTBEAT     | 5   | Liveness probe.                                           |
/// | HEARTBEAT_ACK | 6   | Answer to a liveness probe.                               |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Connect = 0,
    Disconnect = 1,
    Event = 2,
    Ack = 3,
    Error = 4,
    Heartbeat = 5,
    HeartbeatAck = 6,
}

impl FrameType {
    pub(crate) fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(FrameType::Connect),
            1 => Some(FrameType::Disconnect),
            2 => Some(FrameType::Event),
            3 => Some(FrameType::Ack),
            4 => Some(FrameType::Error),
            5 => Some(FrameType::Heartbeat),
            6 => Some(FrameType::HeartbeatAck),
            _ => None,
        }
    }
}

/// An application payload: compact JSON by default, raw bytes when the
/// BINARY flag is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Json(Value),
    Binary(Bytes),
}

impl Payload {
    /// The JSON value, or `Null` for binary payloads.
    pub fn json(&self) -> &Value {
        match self {
            Payload::Json(v) => v,
            Payload::Binary(_) => &Value::Null,
        }
    }

    pub fn into_json(self) -> Value {
        match self {
            Payload::Json(v) => v,
            Payload::Binary(_) => Value::Null,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Json(v) => v.is_null(),
            Payload::Binary(b) => b.is_empty(),
        }
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Payload::Json(v)
    }
}
impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Payload::Binary(b)
    }
}

/// A single decoded wire message.
///
/// The codec in [`crate::codec`] maps this to and from the binary layout:
///
/// ```text
/// [ver:1][type:1][flags:1][ns_len:2 BE][ns:utf8]
///         [evt_len:2 BE][evt:utf8]
///         [ack_id:4 BE]?        // present iff ACK_REQUESTED or type == ACK
///         [payload_len:4 BE][payload:bytes]
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub ty: FrameType,
    /// Namespace path, beginning with `/`. Empty for heartbeat frames.
    pub ns: String,
    /// Event name. Empty for non-EVENT frames.
    pub event: String,
    /// Correlation id, present on ACK frames and on EVENT frames that
    /// request an acknowledgement.
    pub ack_id: Option<u32>,
    pub payload: Payload,
}

impl Frame {
    pub fn event(ns: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            ty: FrameType::Event,
            ns: ns.into(),
            event: event.into(),
            ack_id: None,
            payload: Payload::Json(data),
        }
    }

    pub fn binary_event(ns: impl Into<String>, event: impl Into<String>, data: Bytes) -> Self {
        Self {
            ty: FrameType::Event,
            ns: ns.into(),
            event: event.into(),
            ack_id: None,
            payload: Payload::Binary(data),
        }
    }

    pub fn ack(ns: impl Into<String>, ack_id: u32, data: Value) -> Self {
        Self {
            ty: FrameType::Ack,
            ns: ns.into(),
            event: String::new(),
            ack_id: Some(ack_id),
            payload: Payload::Json(data),
        }
    }

    /// The frame sent by the server right after a socket is attached to its
    /// namespace; the payload carries the allocated socket id.
    pub fn connect(ns: impl Into<String>, sid: SocketId) -> Self {
        Self {
            ty: FrameType::Connect,
            ns: ns.into(),
            event: String::new(),
            ack_id: None,
            payload: Payload::Json(serde_json::json!({ "sid": sid })),
        }
    }

    pub fn disconnect(ns: impl Into<String>) -> Self {
        Self {
            ty: FrameType::Disconnect,
            ns: ns.into(),
            event: String::new(),
            ack_id: None,
            payload: Payload::Json(Value::Null),
        }
    }

    pub fn error(ns: impl Into<String>, payload: &ErrorPayload) -> Self {
        Self {
            ty: FrameType::Error,
            ns: ns.into(),
            event: String::new(),
            ack_id: None,
            payload: Payload::Json(serde_json::to_value(payload).unwrap_or(Value::Null)),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            ty: FrameType::Heartbeat,
            ns: String::new(),
            event: String::new(),
            ack_id: None,
            payload: Payload::Json(Value::Null),
        }
    }

    pub fn heartbeat_ack() -> Self {
        Self {
            ty: FrameType::HeartbeatAck,
            ns: String::new(),
            event: String::new(),
            ack_id: None,
            payload: Payload::Json(Value::Null),
        }
    }

    /// Requests an acknowledgement for this EVENT frame.
    pub fn with_ack_id(mut self, ack_id: u32) -> Self {
        self.ack_id = Some(ack_id);
        self
    }
}

/// Payload of an ERROR frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Stable machine readable code, see the error design table.
    pub code: String,
    pub message: String,
    /// The offending event, when the error relates to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            event: None,
        }
    }

    pub fn for_event(
        code: impl Into<String>,
        message: impl Into<String>,
        event: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            event: Some(event.into()),
        }
    }
}
