//! A [`Socket`] represents one accepted WebSocket connection bound to a
//! namespace.
//!
//! All inbound dispatch for a socket runs on its connection task, so frames
//! from one sender are observed by handlers in arrival order. Outbound sends
//! go through a bounded per-socket channel drained by a writer task, which
//! keeps writes to a single transport ordered even when many broadcast
//! sources fan in.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU32, AtomicU8, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Instant,
};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

use roomcast_core::{
    ack::{AckFuture, AckResult},
    codec, is_reserved_event, AckError, Frame, FrameType, SocketId, RATE_LIMITED_EVENT,
};

use crate::{
    config::{ServerConfig, HEARTBEAT_PROBE_RETRIES, HEARTBEAT_PROBE_TIMEOUT},
    errors::SendError,
    extensions::Extensions,
    handler::{AckSender, MessageHandler},
    metrics::Counters,
    ns::Namespace,
    operators::{BroadcastOperators, RoomParam},
    rate_limit::{Admission, SocketRateLimiter},
    rooms::Room,
};

/// Socket lifecycle, modelled as an explicit state machine rather than a
/// pair of booleans. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SocketState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl SocketState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SocketState::Connecting,
            1 => SocketState::Open,
            2 => SocketState::Closing,
            _ => SocketState::Closed,
        }
    }
}

/// Why a socket detached from its namespace.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DisconnectReason {
    /// The peer closed the transport gracefully.
    TransportClose,
    /// The transport failed (network loss, write error).
    TransportError,
    /// The peer stopped answering heartbeat probes.
    HeartbeatTimeout,
    /// The peer sent a frame that could not be decoded.
    FrameParsingError,
    /// The client sent a DISCONNECT frame.
    ClientDisconnect,
    /// The application called [`Socket::disconnect`].
    ServerDisconnect,
    /// The whole server is shutting down.
    ClosingServer,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use DisconnectReason::*;
        let str: &'static str = match self {
            TransportClose => "peer gracefully closed the connection",
            TransportError => "the connection was abruptly closed",
            HeartbeatTimeout => "peer did not answer heartbeat probes",
            FrameParsingError => "peer sent an undecodable frame",
            ClientDisconnect => "client detached from the namespace",
            ServerDisconnect => "socket was disconnected by the server",
            ClosingServer => "server is being closed",
        };
        f.write_str(str)
    }
}

pub struct Socket {
    /// The socket id, unique for the lifetime of the process.
    pub id: SocketId,

    /// Key-value scratchpad shared between middleware and handlers for the
    /// lifetime of the socket.
    pub extensions: Extensions,

    pub(crate) ns: Arc<Namespace>,
    pub(crate) rooms: RwLock<HashSet<Room>>,
    pub(crate) counters: Arc<Counters>,

    config: Arc<ServerConfig>,
    state: AtomicU8,
    handlers: RwLock<HashMap<String, MessageHandler>>,
    /// Shared with the reaper tasks so entries can be timed out without
    /// keeping the socket itself alive.
    ack_table: Arc<Mutex<HashMap<u32, oneshot::Sender<AckResult>>>>,
    ack_counter: AtomicU32,
    limiter: SocketRateLimiter,
    last_activity: Mutex<Instant>,

    /// Outbound channel drained by the connection's writer task.
    tx: mpsc::Sender<Message>,

    pong_tx: mpsc::Sender<()>,
    pong_rx: Mutex<Option<mpsc::Receiver<()>>>,
    heartbeat_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Socket {
    pub(crate) fn new(
        id: SocketId,
        ns: Arc<Namespace>,
        tx: mpsc::Sender<Message>,
        config: Arc<ServerConfig>,
        counters: Arc<Counters>,
    ) -> Arc<Self> {
        let (pong_tx, pong_rx) = mpsc::channel(1);
        Arc::new(Self {
            id,
            extensions: Extensions::new(),
            limiter: SocketRateLimiter::new(Arc::new(config.rate_limit.clone())),
            ns,
            rooms: RwLock::new(HashSet::new()),
            counters,
            config,
            state: AtomicU8::new(SocketState::Connecting as u8),
            handlers: RwLock::new(HashMap::new()),
            ack_table: Arc::new(Mutex::new(HashMap::new())),
            ack_counter: AtomicU32::new(0),
            last_activity: Mutex::new(Instant::now()),
            tx,
            pong_tx,
            pong_rx: Mutex::new(Some(pong_rx)),
            heartbeat_handle: Mutex::new(None),
        })
    }

    /// The namespace path this socket is bound to.
    pub fn ns_path(&self) -> &str {
        self.ns.path()
    }

    pub fn state(&self) -> SocketState {
        SocketState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn connected(&self) -> bool {
        self.state() == SocketState::Open
    }

    pub(crate) fn set_state(&self, state: SocketState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Wins the race to start closing. Returns false when another caller
    /// already moved the socket past `Open`.
    fn begin_close(&self) -> bool {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                (v < SocketState::Closing as u8).then_some(SocketState::Closing as u8)
            })
            .is_ok()
    }

    /// Registers a per-socket event handler, consulted when the namespace
    /// has no handler for the event.
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
        self.handlers.write().unwrap().insert(event, Arc::new(handler));
    }

    /// Emits an event to this socket's peer.
    pub fn emit<T: Serialize>(&self, event: impl Into<String>, data: T) -> Result<(), SendError> {
        let value = serde_json::to_value(data).map_err(roomcast_core::FrameError::from)?;
        self.send_frame(&Frame::event(self.ns_path().to_owned(), event.into(), value))
    }

    /// Emits a raw binary payload to this socket's peer.
    pub fn emit_binary(
        &self,
        event: impl Into<String>,
        data: Bytes,
    ) -> Result<(), SendError> {
        self.send_frame(&Frame::binary_event(
            self.ns_path().to_owned(),
            event.into(),
            data,
        ))
    }

    /// Emits an event and waits for the peer's acknowledgement.
    ///
    /// The returned future resolves with the decoded ack payload, or with
    /// [`AckError::Timeout`] after the configured `ack_timeout`.
    pub fn emit_with_ack<T: Serialize, V: DeserializeOwned>(
        &self,
        event: impl Into<String>,
        data: T,
    ) -> Result<AckFuture<V>, SendError> {
        let value = serde_json::to_value(data).map_err(roomcast_core::FrameError::from)?;
        let (tx, rx) = oneshot::channel();
        let id = self.register_ack(tx);
        let frame =
            Frame::event(self.ns_path().to_owned(), event.into(), value).with_ack_id(id);
        if let Err(e) = self.send_frame(&frame) {
            self.ack_table.lock().unwrap().remove(&id);
            return Err(e);
        }
        self.spawn_ack_reaper(id);
        Ok(AckFuture::new(rx))
    }

    // Room actions

    /// Joins the given rooms. Already-joined rooms are a no-op.
    pub fn join(&self, rooms: impl RoomParam) {
        for room in rooms.into_room_iter() {
            self.ns.rooms.join(self, room);
        }
    }

    /// Leaves the given rooms. Rooms the socket is not in are a no-op.
    pub fn leave(&self, rooms: impl RoomParam) {
        for room in rooms.into_room_iter() {
            self.ns.rooms.leave(self, &room);
        }
    }

    /// Leaves every joined room.
    pub fn leave_all(&self) {
        self.ns.rooms.cleanup(self);
    }

    /// The rooms this socket currently belongs to.
    pub fn rooms(&self) -> Vec<Room> {
        self.rooms.read().unwrap().iter().cloned().collect()
    }

    /// Selects every socket in the given rooms **except this one**, the
    /// broadcast variant of a room emit.
    pub fn to(&self, rooms: impl RoomParam) -> BroadcastOperators {
        BroadcastOperators::from_sender(self.ns.clone(), self.id).to(rooms)
    }

    /// Selects every other socket in the namespace.
    pub fn broadcast(&self) -> BroadcastOperators {
        BroadcastOperators::from_sender(self.ns.clone(), self.id)
    }

    /// Disconnects the socket from the server side, after a best-effort
    /// DISCONNECT frame to the peer.
    pub fn disconnect(self: Arc<Self>) {
        self.send_frame(&Frame::disconnect(self.ns_path().to_owned()))
            .ok();
        self.close(DisconnectReason::ServerDisconnect);
    }

    // Wire plumbing

    pub(crate) fn send_frame(&self, frame: &Frame) -> Result<(), SendError> {
        let bytes = codec::encode(frame, &self.config.codec)?;
        self.send_raw(bytes)
    }

    pub(crate) fn send_raw(&self, bytes: Bytes) -> Result<(), SendError> {
        if self.state() >= SocketState::Closing {
            return Err(SendError::Closed);
        }
        self.tx
            .try_send(Message::Binary(bytes.to_vec()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::BufferFull,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })?;
        Counters::incr(&self.counters.frames_out);
        Ok(())
    }

    fn register_ack(&self, tx: oneshot::Sender<AckResult>) -> u32 {
        let mut table = self.ack_table.lock().unwrap();
        // the counter wraps; skip ids still outstanding
        let id = loop {
            let id = self
                .ack_counter
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            if !table.contains_key(&id) {
                break id;
            }
        };
        table.insert(id, tx);
        id
    }

    fn spawn_ack_reaper(&self, id: u32) {
        let table = Arc::clone(&self.ack_table);
        let counters = Arc::clone(&self.counters);
        let timeout = self.config.ack_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = table.lock().unwrap().remove(&id) {
                Counters::incr(&counters.ack_timeouts);
                tx.send(Err(AckError::Timeout)).ok();
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn outstanding_acks(&self) -> usize {
        self.ack_table.lock().unwrap().len()
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    // Inbound dispatch, called from the connection task in arrival order.

    pub(crate) fn recv(self: Arc<Self>, frame: Frame) {
        self.touch();
        match frame.ty {
            FrameType::Event => self.recv_event(frame),
            FrameType::Ack => self.recv_ack(frame),
            FrameType::Heartbeat => {
                self.send_frame(&Frame::heartbeat_ack()).ok();
            }
            FrameType::HeartbeatAck => {
                self.pong_tx.try_send(()).ok();
            }
            FrameType::Disconnect => self.close(DisconnectReason::ClientDisconnect),
            FrameType::Connect | FrameType::Error => {
                debug!(sid = %self.id, ty = ?frame.ty, "unexpected frame type from client, dropping");
            }
        }
    }

    fn recv_event(self: Arc<Self>, frame: Frame) {
        let event = frame.event;

        match self.limiter.admit(&event, Instant::now()) {
            Admission::Allowed => {}
            Admission::Denied { retry_after } => {
                Counters::incr(&self.counters.rate_limited);
                warn!(sid = %self.id, event, "rate limit exceeded, dropping frame");
                let payload = json!({
                    "event": event,
                    "retryAfterMs": retry_after.as_millis() as u64,
                });
                self.send_frame(&Frame::event(
                    self.ns_path().to_owned(),
                    RATE_LIMITED_EVENT,
                    payload,
                ))
                .ok();
                return;
            }
        }

        let data = frame.payload.into_json();

        for middleware in self.ns.middleware_snapshot() {
            if let Err(mut payload) = middleware(&self, &event, &data) {
                payload.event.get_or_insert_with(|| event.clone());
                debug!(sid = %self.id, event, code = %payload.code, "middleware rejected event");
                self.send_frame(&Frame::error(self.ns_path().to_owned(), &payload))
                    .ok();
                return;
            }
        }

        // Routing order: namespace handler, then per-socket handler, then
        // the server-level handler, otherwise drop.
        let handler = self
            .ns
            .handler(&event)
            .or_else(|| self.handlers.read().unwrap().get(event.as_str()).cloned())
            .or_else(|| self.ns.server_handler(&event));
        let Some(handler) = handler else {
            debug!(sid = %self.id, event, "no handler registered, dropping event");
            return;
        };

        let ack = frame
            .ack_id
            .map(|id| AckSender::new(Arc::clone(&self), id));
        let socket = Arc::clone(&self);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            handler(socket, data, ack)
        }));
        if result.is_err() {
            Counters::incr(&self.counters.handler_panics);
            error!(sid = %self.id, event, "handler panicked; socket stays open");
        }
    }

    fn recv_ack(&self, frame: Frame) {
        let Some(id) = frame.ack_id else {
            debug!(sid = %self.id, "ack frame without an id, dropping");
            return;
        };
        if let Some(tx) = self.ack_table.lock().unwrap().remove(&id) {
            tx.send(Ok(frame.payload.into_json())).ok();
        } else {
            debug!(sid = %self.id, ack_id = id, "ack for unknown or reaped id, dropping");
        }
    }

    // Heartbeat

    /// Spawns the liveness job: once the socket has been idle for
    /// `connection_timeout` it is probed; a probe unanswered
    /// [`HEARTBEAT_PROBE_RETRIES`] times closes the connection.
    pub(crate) fn spawn_heartbeat(self: Arc<Self>) {
        let socket = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            if socket.heartbeat_job().await.is_err() {
                debug!(sid = %socket.id, "heartbeat probes unanswered, closing");
                socket.clone().close(DisconnectReason::HeartbeatTimeout);
            }
        });
        self.heartbeat_handle.lock().unwrap().replace(handle);
    }

    async fn heartbeat_job(&self) -> Result<(), ()> {
        let Some(mut pong_rx) = self.pong_rx.lock().unwrap().take() else {
            return Ok(());
        };
        let idle = self.config.connection_timeout;
        loop {
            // sleep until the socket has actually been idle long enough
            loop {
                let elapsed = self.last_activity.lock().unwrap().elapsed();
                match idle.checked_sub(elapsed) {
                    Some(remaining) => tokio::time::sleep(remaining).await,
                    None => break,
                }
            }

            let mut answered = false;
            for _ in 0..HEARTBEAT_PROBE_RETRIES {
                // drop a stale answer from a previous round
                pong_rx.try_recv().ok();
                if self.send_frame(&Frame::heartbeat()).is_err() {
                    return Err(());
                }
                if tokio::time::timeout(HEARTBEAT_PROBE_TIMEOUT, pong_rx.recv())
                    .await
                    .ok()
                    .flatten()
                    .is_some()
                {
                    answered = true;
                    break;
                }
            }
            if !answered {
                return Err(());
            }
            self.touch();
        }
    }

    fn abort_heartbeat(&self) {
        if let Some(handle) = self.heartbeat_handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    // Lifecycle

    /// Tears the socket down: rooms, membership, disconnect handlers,
    /// outstanding acks, limiter state. Idempotent; the first caller wins.
    pub(crate) fn close(self: Arc<Self>, reason: DisconnectReason) {
        if !self.begin_close() {
            return;
        }
        debug!(sid = %self.id, %reason, "closing socket");
        self.abort_heartbeat();
        for (_, tx) in self.ack_table.lock().unwrap().drain() {
            tx.send(Err(AckError::Closed)).ok();
        }
        self.limiter.reset_all();
        self.tx.try_send(Message::Close(None)).ok();
        self.ns.remove_socket(Arc::clone(&self), reason);
        self.set_state(SocketState::Closed);
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("sid", &self.id)
            .field("ns", &self.ns_path())
            .field("state", &self.state())
            .field("rooms", &self.rooms)
            .finish()
    }
}

impl PartialEq for Socket {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

#[cfg(test)]
impl Socket {
    /// A socket wired to a throwaway channel, for unit tests that need no
    /// transport.
    pub(crate) fn new_dummy(id: SocketId, ns: Arc<Namespace>) -> Arc<Socket> {
        let (tx, rx) = mpsc::channel(256);
        // keep the receiver alive so sends succeed
        std::mem::forget(rx);
        let socket = Socket::new(
            id,
            ns.clone(),
            tx,
            Arc::new(ServerConfig::default()),
            Arc::new(Counters::default()),
        );
        socket.set_state(SocketState::Open);
        ns.insert_socket(socket.clone());
        socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_transitions_only_move_forward() {
        let ns = Namespace::new_dummy("/");
        let socket = Socket::new_dummy(SocketId::new(), ns);
        assert_eq!(socket.state(), SocketState::Open);
        assert!(socket.begin_close());
        assert!(!socket.begin_close());
        socket.set_state(SocketState::Closed);
        assert!(!socket.begin_close());
    }

    #[tokio::test]
    async fn ack_ids_are_unique_while_outstanding() {
        let ns = Namespace::new_dummy("/");
        let socket = Socket::new_dummy(SocketId::new(), ns);

        let mut ids = HashSet::new();
        for _ in 0..100 {
            let (tx, _rx) = oneshot::channel();
            ids.insert(socket.register_ack(tx));
        }
        assert_eq!(ids.len(), 100);
    }

    #[tokio::test]
    async fn ack_counter_skips_ids_still_outstanding_after_wrap() {
        let ns = Namespace::new_dummy("/");
        let socket = Socket::new_dummy(SocketId::new(), ns);

        let (tx, _rx1) = oneshot::channel();
        let first = socket.register_ack(tx);
        assert_eq!(first, 1);

        // force the counter to wrap right before the outstanding id
        socket.ack_counter.store(u32::MAX, Ordering::Relaxed);
        let (tx, _rx2) = oneshot::channel();
        let wrapped = socket.register_ack(tx);
        assert_eq!(wrapped, 0);
        let (tx, _rx3) = oneshot::channel();
        // id 1 is still outstanding and must be skipped
        assert_eq!(socket.register_ack(tx), 2);
    }

    #[tokio::test]
    async fn close_fails_outstanding_acks_exactly_once() {
        let ns = Namespace::new_dummy("/");
        let socket = Socket::new_dummy(SocketId::new(), ns);

        let (tx, rx) = oneshot::channel();
        socket.register_ack(tx);
        socket.clone().close(DisconnectReason::TransportError);

        let fut = AckFuture::<Value>::new(rx);
        assert!(matches!(fut.await.unwrap_err(), AckError::Closed));
        assert_eq!(socket.outstanding_acks(), 0);
    }

    #[tokio::test]
    async fn emit_after_close_is_rejected() {
        let ns = Namespace::new_dummy("/");
        let socket = Socket::new_dummy(SocketId::new(), ns);
        socket.clone().close(DisconnectReason::TransportClose);
        assert!(matches!(
            socket.emit("ev", json!(1)),
            Err(SendError::Closed)
        ));
    }
}
