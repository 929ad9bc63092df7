//! Standalone broker binary with a demo chat namespace.
//!
//! Configuration comes from the environment:
//! `ROOMCAST_HOST`, `ROOMCAST_PORT`, `ROOMCAST_MAX_CONNECTIONS`,
//! `ROOMCAST_RATE_LIMIT` (requests per second, enables the limiter),
//! `ROOMCAST_ENCRYPTION_KEY` (32 bytes, hex or raw).

use std::{net::IpAddr, time::Duration};

use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use roomcast_server::{Server, ServerConfig, ServerConfigBuilder};

fn env_key(raw: &str) -> Option<[u8; 32]> {
    let bytes = raw.as_bytes();
    if bytes.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(bytes);
        return Some(key);
    }
    if raw.len() == 64 {
        let mut key = [0u8; 32];
        for (i, chunk) in raw.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).ok()?;
            key[i] = u8::from_str_radix(hex, 16).ok()?;
        }
        return Some(key);
    }
    None
}

fn config_from_env() -> ServerConfig {
    let mut builder = ServerConfigBuilder::new();
    if let Ok(host) = std::env::var("ROOMCAST_HOST") {
        match host.parse::<IpAddr>() {
            Ok(host) => builder = builder.host(host),
            Err(_) => warn!(%host, "invalid ROOMCAST_HOST, using default"),
        }
    }
    if let Some(port) = std::env::var("ROOMCAST_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        builder = builder.port(port);
    }
    if let Some(max) = std::env::var("ROOMCAST_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        builder = builder.max_connections(max);
    }
    if let Some(max_rps) = std::env::var("ROOMCAST_RATE_LIMIT")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        builder = builder
            .enable_rate_limiting(true)
            .rate_limit_window(Duration::from_secs(1))
            .rate_limit_max_requests(max_rps);
    }
    if let Ok(raw) = std::env::var("ROOMCAST_ENCRYPTION_KEY") {
        match env_key(&raw) {
            Some(key) => builder = builder.encryption_key(key),
            None => warn!("ROOMCAST_ENCRYPTION_KEY must be 32 raw bytes or 64 hex chars"),
        }
    }
    builder.build()
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let server = Server::new(config_from_env());

    let chat = server.namespace("/chat");
    chat.on_connect(|socket| {
        info!(sid = %socket.id, "chat client connected");
    });
    chat.on("join", |socket, data, ack| {
        if let Some(room) = data["room"].as_str() {
            socket.join(room.to_owned());
            if let Some(ack) = ack {
                ack.send(json!({ "joined": room })).ok();
            }
        }
    });
    chat.on("leave", |socket, data, _ack| {
        if let Some(room) = data["room"].as_str() {
            socket.leave(room.to_owned());
        }
    });
    let ns = chat.clone();
    chat.on("say", move |socket, data, _ack| {
        if let Some(room) = data["room"].as_str() {
            ns.to(room.to_owned())
                .emit(
                    "said",
                    json!({ "from": socket.id, "text": data["text"] }),
                )
                .ok();
        }
    });
    chat.on_disconnect(|socket, reason| {
        info!(sid = %socket.id, %reason, "chat client disconnected");
    });

    server.listen().await?;

    tokio::signal::ctrl_c().await?;
    info!(counters = ?server.counters(), "shutting down");
    server.close().await;
    Ok(())
}
