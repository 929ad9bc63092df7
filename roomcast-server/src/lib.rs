//! Roomcast broker runtime.
//!
//! A single process accepts many long-lived WebSocket connections,
//! multiplexes them by namespace and room, and routes application events
//! between clients with optional per-connection acknowledgements.
//!
//! ## Features
//! * Namespaces bound by the upgrade URL path, each with its own handler
//!   table, middleware chain and room index
//! * Room fan-out with copy-on-read membership snapshots
//! * Acknowledgements correlated by per-sender 32 bit ids with timeout
//!   reaping
//! * Sliding-window rate limiting, global and per-event
//! * Heartbeat probing of idle connections
//! * Payload compression (DEFLATE) and optional AES-256-CBC encryption
//!
//! ## Example
//! ```no_run
//! use roomcast_server::{Server, ServerConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let server = Server::new(ServerConfig::builder().port(8090).build());
//!
//!     let chat = server.namespace("/chat");
//!     chat.on("join", |socket, data, _ack| {
//!         if let Some(room) = data["room"].as_str() {
//!             socket.join(room.to_owned());
//!         }
//!     });
//!     let ns = chat.clone();
//!     chat.on("say", move |socket, data, _ack| {
//!         if let Some(room) = data["room"].as_str() {
//!             ns.to(room.to_owned())
//!                 .emit("said", json!({ "from": socket.id, "text": data["text"] }))
//!                 .ok();
//!         }
//!     });
//!
//!     server.listen().await?;
//!     std::future::pending::<()>().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod errors;
pub mod extensions;
pub mod handler;
pub mod metrics;
pub mod ns;
pub mod operators;
pub mod rate_limit;
pub mod rooms;
pub mod server;
pub mod socket;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use errors::{AckError, BroadcastError, SendError};
pub use handler::AckSender;
pub use metrics::CountersSnapshot;
pub use ns::Namespace;
pub use operators::{BroadcastOperators, RoomParam};
pub use rate_limit::{Admission, EventLimit, RateLimitConfig};
pub use rooms::{Room, RoomIndex};
pub use server::Server;
pub use socket::{DisconnectReason, Socket, SocketState};

pub use roomcast_core::{
    AckFuture, CodecConfig, ErrorPayload, Frame, FrameType, SocketId, RESERVED_EVENTS,
};
