
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use fixture::*;
use roomcast_core::Frame;
use roomcast_server::DisconnectReason;

/// Closing the transport removes the socket from its rooms and namespace
/// and fires the disconnect handlers.
#[tokio::test]
async fn disconnect_cleans_up_membership() {
    let (server, addr) = create_server(test_config()).await;
    let ns = server.namespace("/chat");
    ns.on("join", |socket, data, ack| {
        socket.join(data["room"].as_str().unwrap_or_default().to_owned());
        if let Some(ack) = ack {
            ack.send(json!({ "ok": true })).ok();
        }
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    ns.on_disconnect(move |socket, reason| {
        tx.send((socket.id, reason)).ok();
    });

    let mut a = connect_client(addr, "/chat").await;
    let a_sid = expect_connect(&mut a).await;
    send_frame(&mut a, &Frame::event("/chat", "join", json!({ "room": "R1" })).with_ack_id(1)).await;
    recv_frame(&mut a).await;
    assert_eq!(ns.rooms.members("R1"), vec![a_sid]);

    drop(a);

    let (sid, reason) = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sid, a_sid);
    assert!(matches!(
        reason,
        DisconnectReason::TransportClose | DisconnectReason::TransportError
    ));
    assert!(ns.rooms.members("R1").is_empty());
    assert!(!ns.rooms.contains("R1"));
    assert!(ns.is_empty());
}

/// A client DISCONNECT frame detaches gracefully.
#[tokio::test]
async fn client_disconnect_frame_detaches() {
    let (server, addr) = create_server(test_config()).await;
    let ns = server.namespace("/chat");
    let (tx, mut rx) = mpsc::unbounded_channel();
    ns.on_disconnect(move |_socket, reason| {
        tx.send(reason).ok();
    });

    let mut a = connect_client(addr, "/chat").await;
    expect_connect(&mut a).await;

    send_frame(&mut a, &Frame::disconnect("/chat")).await;

    let reason = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason, DisconnectReason::ClientDisconnect);
    assert!(ns.is_empty());
}

/// Server shutdown closes every socket in every namespace.
#[tokio::test]
async fn server_close_disconnects_everyone() {
    let (server, addr) = create_server(test_config()).await;
    let ns = server.namespace("/chat");
    let (tx, mut rx) = mpsc::unbounded_channel();
    ns.on_disconnect(move |socket, reason| {
        tx.send((socket.id, reason)).ok();
    });

    let mut a = connect_client(addr, "/chat").await;
    let mut b = connect_client(addr, "/chat").await;
    expect_connect(&mut a).await;
    expect_connect(&mut b).await;
    assert_eq!(ns.len(), 2);

    server.close().await;

    for _ in 0..2 {
        let (_, reason) = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, DisconnectReason::ClosingServer);
    }
    assert!(ns.is_empty());

    // new upgrades are refused after close
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        tokio_tungstenite::connect_async(format!("ws://{addr}/chat"))
            .await
            .is_err()
    );
}
