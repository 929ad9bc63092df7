//! The broker handle and its accept loop.
//!
//! One connection task per accepted socket reads, decodes and dispatches
//! frames in arrival order; a writer task drains the socket's outbound
//! channel so writes to a single transport stay serialised. Namespace lookup
//! and the connection cap are enforced inside the upgrade handshake, before
//! any socket state is allocated.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
        Message,
    },
    WebSocketStream,
};
use tracing::{debug, info, warn};

use roomcast_core::{codec, is_reserved_event, ErrorPayload, Frame, SocketId};

use crate::{
    config::ServerConfig,
    handler::{AckSender, MessageHandler},
    metrics::{Counters, CountersSnapshot},
    ns::Namespace,
    socket::{DisconnectReason, Socket, SocketState},
};

/// The broker handle. Cheap to clone; all clones share the same runtime
/// state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    config: Arc<ServerConfig>,
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
    handlers: RwLock<HashMap<String, MessageHandler>>,
    counters: Arc<Counters>,
    conn_count: AtomicUsize,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Creates a broker with the given configuration. The root namespace
    /// `/` always exists.
    pub fn new(config: ServerConfig) -> Self {
        let config = Arc::new(config);
        let inner = Arc::new(ServerInner {
            config: config.clone(),
            namespaces: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
            conn_count: AtomicUsize::new(0),
            accept_handle: Mutex::new(None),
        });
        let root = Namespace::new("/".to_owned(), config, Arc::downgrade(&inner));
        inner.namespaces.write().unwrap().insert("/".to_owned(), root);
        Self { inner }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Returns the namespace at `path`, creating it if needed. Namespaces
    /// are meant to be registered before [`listen`](Self::listen) is called;
    /// an upgrade naming an unregistered path is rejected.
    ///
    /// # Panics
    /// Panics when `path` does not start with `/`.
    pub fn namespace(&self, path: impl Into<String>) -> Arc<Namespace> {
        let path = path.into();
        assert!(path.starts_with('/'), "namespace path must start with '/'");
        let mut namespaces = self.inner.namespaces.write().unwrap();
        if let Some(ns) = namespaces.get(&path) {
            return ns.clone();
        }
        debug!(%path, "registering namespace");
        let ns = Namespace::new(
            path.clone(),
            self.inner.config.clone(),
            Arc::downgrade(&self.inner),
        );
        namespaces.insert(path, ns.clone());
        ns
    }

    pub fn get_namespace(&self, path: &str) -> Option<Arc<Namespace>> {
        self.inner.get_namespace(path)
    }

    /// Registers a server-level handler: the last stop of the routing order,
    /// consulted when neither the namespace nor the socket has a handler for
    /// the event.
    pub fn on(
        &self,
        event: impl Into<String>,
        handler: impl Fn(Arc<Socket>, Value, Option<AckSender>) + Send + Sync + 'static,
    ) {
        let event = event.into();
        assert!(
            !is_reserved_event(&event),
            "`{event}` is a reserved event name"
        );
        self.inner
            .handlers
            .write()
            .unwrap()
            .insert(event, Arc::new(handler));
    }

    /// Finds a socket by id across all namespaces, the `server.to(socketId)`
    /// addressing surface.
    pub fn to_socket(&self, sid: SocketId) -> Option<Arc<Socket>> {
        self.inner
            .namespaces
            .read()
            .unwrap()
            .values()
            .find_map(|ns| ns.get_socket(sid))
    }

    /// A point-in-time copy of the broker counters.
    pub fn counters(&self) -> CountersSnapshot {
        self.inner.counters.snapshot()
    }

    /// Number of currently accepted connections.
    pub fn connection_count(&self) -> usize {
        self.inner.conn_count.load(Ordering::SeqCst)
    }

    /// Binds the listener and spawns the accept loop. Returns the bound
    /// address, which is useful with port 0.
    pub async fn listen(&self) -> std::io::Result<SocketAddr> {
        let addr = SocketAddr::new(self.inner.config.host, self.inner.config.port);
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "roomcast broker listening");

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(inner.clone(), stream, peer));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        });
        self.inner.accept_handle.lock().unwrap().replace(handle);
        Ok(local)
    }

    /// Stops accepting and closes every socket in every namespace.
    pub async fn close(&self) {
        if let Some(handle) = self.inner.accept_handle.lock().unwrap().take() {
            handle.abort();
        }
        let namespaces: Vec<_> = self
            .inner
            .namespaces
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for ns in namespaces {
            ns.close_all(DisconnectReason::ClosingServer);
        }
        info!("roomcast broker closed");
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("namespaces", &self.inner.namespaces.read().unwrap().len())
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl ServerInner {
    pub(crate) fn get_namespace(&self, path: &str) -> Option<Arc<Namespace>> {
        self.namespaces.read().unwrap().get(path).cloned()
    }

    pub(crate) fn global_handler(&self, event: &str) -> Option<MessageHandler> {
        self.handlers.read().unwrap().get(event).cloned()
    }

    /// Reserves a connection slot, failing when the cap is reached.
    fn try_reserve_slot(&self) -> bool {
        self.conn_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < self.config.max_connections).then_some(count + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.conn_count.fetch_sub(1, Ordering::SeqCst);
        Counters::decr(&self.counters.connections_current);
    }
}

/// Releases the reserved connection slot when the connection task ends on
/// any path.
struct SlotGuard {
    inner: Arc<ServerInner>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.release_slot();
    }
}

fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(body.to_owned()));
    *resp.status_mut() = status;
    resp
}

async fn handle_connection(inner: Arc<ServerInner>, stream: TcpStream, peer: SocketAddr) {
    let reserved = inner.try_reserve_slot();
    if reserved {
        Counters::incr(&inner.counters.connections_current);
    }

    // The upgrade URL path, stripped of its query, names the namespace. Both
    // rejections happen before any socket state exists.
    let mut upgrade: Option<(String, Option<String>)> = None;
    let callback = |req: &Request, resp: Response| {
        if !reserved {
            Counters::incr(&inner.counters.connections_rejected);
            return Err(reject(StatusCode::SERVICE_UNAVAILABLE, "max_connections"));
        }
        let path = req.uri().path().to_owned();
        if inner.get_namespace(&path).is_none() {
            Counters::incr(&inner.counters.connections_rejected);
            return Err(reject(StatusCode::NOT_FOUND, "unknown_namespace"));
        }
        let auth = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        upgrade = Some((path, auth));
        Ok(resp)
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "handshake rejected or failed");
            if reserved {
                inner.release_slot();
            }
            return;
        }
    };
    let guard = SlotGuard {
        inner: inner.clone(),
    };
    let Some((path, auth)) = upgrade else {
        return;
    };
    let Some(ns) = inner.get_namespace(&path) else {
        return;
    };

    run_connection(inner.clone(), ns, ws, path, auth, peer).await;
    drop(guard);
}

async fn run_connection(
    inner: Arc<ServerInner>,
    ns: Arc<Namespace>,
    ws: WebSocketStream<TcpStream>,
    path: String,
    auth: Option<String>,
    peer: SocketAddr,
) {
    let config = inner.config.clone();
    let counters = inner.counters.clone();
    let (sink, mut read) = ws.split();

    let (tx, rx) = mpsc::channel::<Message>(config.max_buffer_size);
    let socket = Socket::new(SocketId::new(), ns.clone(), tx, config.clone(), counters.clone());
    if let Some(auth) = auth {
        socket.extensions.insert("authorization", auth);
    }
    ns.insert_socket(socket.clone());
    Counters::incr(&counters.connections_opened);
    debug!(sid = %socket.id, %peer, ns = %path, "socket connected");

    let writer = tokio::spawn(write_loop(rx, sink));

    socket.set_state(SocketState::Open);
    if socket
        .send_frame(&Frame::connect(path.clone(), socket.id))
        .is_err()
    {
        socket.clone().close(DisconnectReason::TransportError);
        writer.abort();
        return;
    }
    ns.fire_connect(&socket);
    socket.clone().spawn_heartbeat();

    while let Some(item) = read.next().await {
        match item {
            Ok(Message::Binary(data)) => {
                Counters::incr(&counters.frames_in);
                match codec::decode(&data, &config.codec) {
                    Ok(frame) => socket.clone().recv(frame),
                    Err(e) => {
                        Counters::incr(&counters.frame_errors);
                        debug!(sid = %socket.id, error = %e, "undecodable frame, closing");
                        let payload = ErrorPayload::new(e.code(), e.to_string());
                        socket
                            .send_frame(&Frame::error(path.clone(), &payload))
                            .ok();
                        socket.clone().close(DisconnectReason::FrameParsingError);
                        break;
                    }
                }
            }
            Ok(Message::Text(_)) => {
                // the protocol is binary-only
                Counters::incr(&counters.frame_errors);
                let payload = ErrorPayload::new("frame_invalid", "text frames are not supported");
                socket
                    .send_frame(&Frame::error(path.clone(), &payload))
                    .ok();
                socket.clone().close(DisconnectReason::FrameParsingError);
                break;
            }
            Ok(Message::Close(_)) => {
                socket.clone().close(DisconnectReason::TransportClose);
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                debug!(sid = %socket.id, error = %e, "transport error");
                socket.clone().close(DisconnectReason::TransportError);
                break;
            }
        }
        if socket.state() >= SocketState::Closing {
            break;
        }
    }

    debug!(sid = %socket.id, "connection task finished");
    socket.close(DisconnectReason::TransportClose);
    writer.abort();
}

async fn write_loop(
    mut rx: mpsc::Receiver<Message>,
    mut sink: futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>,
) {
    while let Some(msg) = rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if sink.send(msg).await.is_err() {
            break;
        }
        if is_close {
            break;
        }
    }
    sink.close().await.ok();
}
