
use std::time::Duration;

use serde_json::json;
use tokio_tungstenite::{connect_async, tungstenite::Error};

use fixture::*;
use roomcast_core::{Frame, FrameType};
use roomcast_server::ServerConfig;

/// Namespaces are isolated: a namespace-wide emit on `/chat` reaches the
/// `/chat` socket (sender included) and never the `/game` one.
#[tokio::test]
async fn namespace_isolation() {
    let (server, addr) = create_server(test_config()).await;
    let chat = server.namespace("/chat");
    server.namespace("/game");
    let ns = chat.clone();
    chat.on("ping", move |_socket, _data, _ack| {
        ns.emit("ping-all", json!({})).unwrap();
    });

    let mut a = connect_client(addr, "/chat").await;
    let mut b = connect_client(addr, "/game").await;
    expect_connect(&mut a).await;
    expect_connect(&mut b).await;

    send_frame(&mut a, &Frame::event("/chat", "ping", json!({}))).await;

    recv_event(&mut a, "ping-all").await;
    assert_no_event(&mut b, Duration::from_millis(200)).await;
}

/// An upgrade naming an unregistered namespace is rejected before any
/// socket state exists.
#[tokio::test]
async fn unknown_namespace_is_rejected() {
    let (server, addr) = create_server(test_config()).await;
    server.namespace("/chat");

    let err = connect_async(format!("ws://{addr}/nope")).await.unwrap_err();
    match err {
        Error::Http(resp) => assert_eq!(resp.status(), 404),
        other => panic!("expected an http rejection, got {other:?}"),
    }
    assert_eq!(server.counters().connections_rejected, 1);
}

/// Upgrades past `max_connections` get a 503 and no socket state; closing
/// a connection frees its slot.
#[tokio::test]
async fn max_connections_is_enforced() {
    let config = ServerConfig::builder().port(0).max_connections(1).build();
    let (server, addr) = create_server(config).await;

    let mut a = connect_client(addr, "/").await;
    expect_connect(&mut a).await;

    let err = connect_async(format!("ws://{addr}/")).await.unwrap_err();
    match err {
        Error::Http(resp) => assert_eq!(resp.status(), 503),
        other => panic!("expected an http rejection, got {other:?}"),
    }
    assert_eq!(server.connection_count(), 1);

    drop(a);
    // the slot frees once the server observes the close
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.connection_count(), 0);
    let mut b = connect_client(addr, "/").await;
    expect_connect(&mut b).await;
}

/// Middleware rejections surface as ERROR frames naming the event; the
/// handler does not run. Middleware may flag the socket via its
/// extensions, letting later events through.
#[tokio::test]
async fn middleware_gates_events() {
    let (server, addr) = create_server(test_config()).await;
    let ns = server.namespace("/");
    ns.use_middleware(|socket, event, data| {
        if event == "login" {
            socket.extensions.insert("authenticated", data["ok"] == json!(true));
            return Ok(());
        }
        if socket.extensions.get("authenticated") == Some(json!(true)) {
            Ok(())
        } else {
            Err(roomcast_core::ErrorPayload::new("auth_failed", "not authenticated"))
        }
    });
    ns.on("login", |_socket, _data, ack| {
        if let Some(ack) = ack {
            ack.send(json!({ "ok": true })).ok();
        }
    });
    ns.on("secret", |_socket, _data, ack| {
        if let Some(ack) = ack {
            ack.send(json!({ "secret": 41 })).ok();
        }
    });

    let mut x = connect_client(addr, "/").await;
    expect_connect(&mut x).await;

    // rejected before login
    send_frame(&mut x, &Frame::event("/", "secret", json!({})).with_ack_id(1)).await;
    let frame = recv_frame(&mut x).await;
    assert_eq!(frame.ty, FrameType::Error);
    assert_eq!(frame.payload.json()["code"], json!("auth_failed"));
    assert_eq!(frame.payload.json()["event"], json!("secret"));

    // authenticate, then allowed
    send_frame(&mut x, &Frame::event("/", "login", json!({ "ok": true })).with_ack_id(2)).await;
    recv_frame(&mut x).await;
    send_frame(&mut x, &Frame::event("/", "secret", json!({})).with_ack_id(3)).await;
    let frame = recv_frame(&mut x).await;
    assert_eq!(frame.ty, FrameType::Ack);
    assert_eq!(frame.payload.json()["secret"], json!(41));
}

/// Routing order: the namespace handler wins over the server-level one;
/// events with no handler anywhere are dropped silently.
#[tokio::test]
async fn routing_prefers_namespace_over_server_handler() {
    let (server, addr) = create_server(test_config()).await;
    server.on("which", |_socket, _data, ack| {
        if let Some(ack) = ack {
            ack.send(json!({ "level": "server" })).ok();
        }
    });
    server.on("which-sock", |_socket, _data, ack| {
        if let Some(ack) = ack {
            ack.send(json!({ "level": "server" })).ok();
        }
    });
    server.namespace("/chat").on("which", |_socket, _data, ack| {
        if let Some(ack) = ack {
            ack.send(json!({ "level": "namespace" })).ok();
        }
    });
    server.namespace("/game").on_connect(|socket| {
        socket.on("which-sock", |_socket, _data, ack| {
            if let Some(ack) = ack {
                ack.send(json!({ "level": "socket" })).ok();
            }
        });
    });

    let mut a = connect_client(addr, "/chat").await;
    expect_connect(&mut a).await;
    send_frame(&mut a, &Frame::event("/chat", "which", json!({})).with_ack_id(1)).await;
    let frame = recv_frame(&mut a).await;
    assert_eq!(frame.payload.json()["level"], json!("namespace"));

    // /game has no namespace handler; the server-level one is the fallback
    let mut b = connect_client(addr, "/game").await;
    expect_connect(&mut b).await;
    send_frame(&mut b, &Frame::event("/game", "which", json!({})).with_ack_id(1)).await;
    let frame = recv_frame(&mut b).await;
    assert_eq!(frame.payload.json()["level"], json!("server"));

    // a per-socket handler wins over the server-level fallback
    send_frame(&mut b, &Frame::event("/game", "which-sock", json!({})).with_ack_id(2)).await;
    let frame = recv_frame(&mut b).await;
    assert_eq!(frame.payload.json()["level"], json!("socket"));

    // unknown events are silently dropped, the connection stays up
    send_frame(&mut b, &Frame::event("/game", "nothing", json!({}))).await;
    assert_no_event(&mut b, Duration::from_millis(150)).await;
}

/// An undecodable frame closes the offending socket with a final ERROR
/// frame; other sockets are unaffected.
#[tokio::test]
async fn malformed_frame_closes_only_the_offender() {
    let (server, addr) = create_server(test_config()).await;
    server.namespace("/").on("echo", |_socket, data, ack| {
        if let Some(ack) = ack {
            ack.send(data).ok();
        }
    });

    let mut bad = connect_client(addr, "/").await;
    let mut good = connect_client(addr, "/").await;
    expect_connect(&mut bad).await;
    expect_connect(&mut good).await;

    use futures_util::SinkExt;
    bad.send(tokio_tungstenite::tungstenite::Message::Binary(vec![0xff, 0x00, 0x01]))
        .await
        .unwrap();
    let frame = recv_frame(&mut bad).await;
    assert_eq!(frame.ty, FrameType::Error);
    assert_eq!(frame.payload.json()["code"], json!("frame_invalid"));

    // the well-behaved socket still works
    send_frame(&mut good, &Frame::event("/", "echo", json!({ "v": 7 })).with_ack_id(1)).await;
    let frame = recv_frame(&mut good).await;
    assert_eq!(frame.payload.json()["v"], json!(7));
    assert_eq!(server.counters().frame_errors, 1);
}

/// The server answers heartbeats with heartbeat-acks.
#[tokio::test]
async fn heartbeat_is_answered() {
    let (_server, addr) = create_server(test_config()).await;
    let mut x = connect_client(addr, "/").await;
    expect_connect(&mut x).await;

    send_frame(&mut x, &Frame::heartbeat()).await;
    let frame = recv_frame(&mut x).await;
    assert_eq!(frame.ty, FrameType::HeartbeatAck);
}
