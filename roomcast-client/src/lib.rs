//! Roomcast client runtime.
//!
//! Mirrors the broker's codec bit-for-bit and adds what a long-lived client
//! needs on a flaky network: reconnection with exponential backoff, an
//! offline emit queue flushed in order on reconnect, ack futures with
//! timeout reaping, and heartbeat-based liveness.
//!
//! ## Example
//! ```no_run
//! use roomcast_client::{Client, ClientConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(
//!         ClientConfig::builder()
//!             .url("ws://127.0.0.1:8090")
//!             .namespace("/chat")
//!             .build(),
//!     );
//!     client.on("said", |data, _ack| {
//!         println!("{} said {}", data["from"], data["text"]);
//!     });
//!     client.connect().await?;
//!
//!     client.emit("join", json!({ "room": "R1" }))?;
//!     let reply: serde_json::Value = client
//!         .emit_with_ack("say", json!({ "room": "R1", "text": "hi" }))?
//!         .await?;
//!     println!("ack: {reply}");
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod errors;
mod queue;
pub mod state;

pub use client::{AckResponder, Client, EventHandler, LIFECYCLE_EVENTS};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use errors::{AckError, ClientError};
pub use state::ConnectionState;

pub use roomcast_core::{AckFuture, CodecConfig, Frame, FrameType, SocketId};
