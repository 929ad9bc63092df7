//! The reconnecting roomcast client.
//!
//! One driver task owns the transport for the lifetime of the client: it
//! runs a session over each established connection and, on transport loss,
//! re-dials with exponential backoff until the attempt budget runs out.
//! Emits made while the transport is down land in the offline queue and are
//! flushed oldest-first on reconnect, before any new emit reaches the wire.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use roomcast_core::{
    ack::{AckFuture, AckResult},
    codec, AckError, Frame, FrameType, SocketId,
};

use crate::{
    config::{ClientConfig, HEARTBEAT_MAX_MISSES},
    errors::ClientError,
    queue::OfflineQueue,
    state::{ConnectionState, InternalState},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An event handler. Receives the decoded payload and, when the server
/// requested an acknowledgement, an [`AckResponder`].
pub type EventHandler = Arc<dyn Fn(Value, Option<AckResponder>) + Send + Sync>;

/// Local lifecycle events fired through the same handler table as server
/// events: `connected`, `reconnected`, `disconnected`,
/// `max_reconnect_reached` and `error`. Unlike the server, the client does
/// not reject registrations on these names; they are how the lifecycle is
/// observed.
pub const LIFECYCLE_EVENTS: &[&str] = &[
    "connected",
    "reconnected",
    "disconnected",
    "max_reconnect_reached",
    "error",
];

/// How a finished session ended.
enum SessionEnd {
    /// Transport loss; reconnect unless the user asked to close.
    Lost,
    /// The server detached us with a DISCONNECT frame; terminal.
    ServerDisconnect,
}

enum FrameAction {
    None,
    Pong,
    ServerDisconnect,
}

/// The client handle. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    state: RwLock<InternalState>,
    handlers: RwLock<HashMap<String, EventHandler>>,
    /// Shared with the reaper tasks so entries can be timed out without
    /// keeping the client alive.
    ack_table: Arc<Mutex<HashMap<u32, oneshot::Sender<AckResult>>>>,
    ack_counter: AtomicU32,
    queue: Mutex<OfflineQueue>,
    send_tx: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    socket_id: RwLock<Option<SocketId>>,
    user_closed: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let queue = OfflineQueue::new(config.queue_capacity, config.queue_ttl);
        Self {
            inner: Arc::new(ClientInner {
                config,
                state: RwLock::new(InternalState::new()),
                handlers: RwLock::new(HashMap::new()),
                ack_table: Arc::new(Mutex::new(HashMap::new())),
                ack_counter: AtomicU32::new(0),
                queue: Mutex::new(queue),
                send_tx: RwLock::new(None),
                socket_id: RwLock::new(None),
                user_closed: AtomicBool::new(false),
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.read().state
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// The id the server allocated for this connection, once bound.
    pub fn socket_id(&self) -> Option<SocketId> {
        *self.inner.socket_id.read()
    }

    /// Number of frames waiting in the offline queue.
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Registers a handler for `event`. Lifecycle events
    /// ([`LIFECYCLE_EVENTS`]) are delivered through the same table.
    pub fn on(
        &self,
        event: impl Into<String>,
        handler: impl Fn(Value, Option<AckResponder>) + Send + Sync + 'static,
    ) {
        self.inner
            .handlers
            .write()
            .insert(event.into(), Arc::new(handler));
    }

    /// Establishes the first connection and spawns the driver task that
    /// owns reconnection from then on.
    pub async fn connect(&self) -> Result<(), ClientError> {
        {
            let mut state = self.inner.state.write();
            if state.state.is_open() || state.state.is_transitioning() {
                return Err(ClientError::AlreadyRunning);
            }
            state.mark_connecting();
        }
        self.inner.user_closed.store(false, Ordering::SeqCst);

        let ws = match ClientInner::dial(&self.inner).await {
            Ok(ws) => ws,
            Err(e) => {
                self.inner.state.write().state = ConnectionState::Idle;
                return Err(e);
            }
        };

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { drive(inner, ws).await });
        self.inner.driver.lock().replace(handle);
        Ok(())
    }

    /// Gracefully detaches and closes the client. Terminal: the driver does
    /// not reconnect afterwards.
    pub async fn disconnect(&self) {
        self.inner.user_closed.store(true, Ordering::SeqCst);

        if let Some(tx) = self.inner.send_tx.read().clone() {
            if let Ok(bytes) = codec::encode(
                &Frame::disconnect(self.inner.config.namespace.clone()),
                &self.inner.config.codec,
            ) {
                tx.send(Message::Binary(bytes.to_vec())).ok();
            }
            tx.send(Message::Close(None)).ok();
        }

        // the driver winds down once it observes user_closed; don't wait
        // out a long backoff sleep if it is mid-reconnect
        let handle = self.inner.driver.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(Duration::from_secs(1), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
        self.inner.state.write().mark_closed();
        for (_, tx) in self.inner.ack_table.lock().drain() {
            tx.send(Err(AckError::Closed)).ok();
        }
        info!("client disconnected");
    }

    /// Emits an event. While the transport is down the frame is queued and
    /// flushed on reconnect, oldest first.
    pub fn emit<T: Serialize>(&self, event: impl Into<String>, data: T) -> Result<(), ClientError> {
        let value = serde_json::to_value(data).map_err(roomcast_core::FrameError::from)?;
        let frame = Frame::event(self.inner.config.namespace.clone(), event.into(), value);
        self.inner.dispatch_out(frame)
    }

    /// Emits an event and waits for the server's acknowledgement.
    ///
    /// For a queued frame the ack timeout only starts when the frame is
    /// actually sent.
    pub fn emit_with_ack<T: Serialize, V: DeserializeOwned>(
        &self,
        event: impl Into<String>,
        data: T,
    ) -> Result<AckFuture<V>, ClientError> {
        let value = serde_json::to_value(data).map_err(roomcast_core::FrameError::from)?;
        let (tx, rx) = oneshot::channel();
        let id = self.inner.register_ack(tx);
        let frame = Frame::event(self.inner.config.namespace.clone(), event.into(), value)
            .with_ack_id(id);
        if let Err(e) = self.inner.dispatch_out(frame) {
            self.inner.ack_table.lock().remove(&id);
            return Err(e);
        }
        Ok(AckFuture::new(rx))
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.inner.config.ws_url())
            .field("state", &self.state())
            .field("queued", &self.queued())
            .finish()
    }
}

impl ClientInner {
    async fn dial(inner: &Arc<ClientInner>) -> Result<WsStream, ClientError> {
        let url = inner.config.ws_url();
        debug!(%url, "dialing");
        let (ws, _) = tokio::time::timeout(inner.config.connect_timeout, connect_async(&url))
            .await
            .map_err(|_| ClientError::ConnectTimeout)??;
        Ok(ws)
    }

    /// Routes a frame to the wire when a session is up, to the offline
    /// queue otherwise. The queue lock serialises against session start so
    /// a frame can never fall between flush and publish.
    fn dispatch_out(&self, frame: Frame) -> Result<(), ClientError> {
        if self.user_closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        if let Some(tx) = self.send_tx.read().clone() {
            return self.send_now(&tx, frame);
        }
        let mut queue = self.queue.lock();
        if let Some(tx) = self.send_tx.read().clone() {
            drop(queue);
            return self.send_now(&tx, frame);
        }
        let evicted = queue.push(frame);
        drop(queue);
        if let Some(evicted) = evicted {
            warn!("offline queue full, discarding the oldest frame");
            self.fail_ack(&evicted.frame, AckError::Timeout);
        }
        Ok(())
    }

    fn send_now(
        &self,
        tx: &mpsc::UnboundedSender<Message>,
        frame: Frame,
    ) -> Result<(), ClientError> {
        let bytes = codec::encode(&frame, &self.config.codec)?;
        let ack_id = frame.ack_id;
        if tx.send(Message::Binary(bytes.to_vec())).is_err() {
            // the session tore down underneath us; queue for the next one
            let evicted = self.queue.lock().push(frame);
            if let Some(evicted) = evicted {
                self.fail_ack(&evicted.frame, AckError::Timeout);
            }
            return Ok(());
        }
        if let Some(id) = ack_id {
            self.spawn_ack_reaper(id);
        }
        Ok(())
    }

    fn register_ack(&self, tx: oneshot::Sender<AckResult>) -> u32 {
        let mut table = self.ack_table.lock();
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
        let timeout = self.config.ack_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = table.lock().remove(&id) {
                tx.send(Err(AckError::Timeout)).ok();
            }
        });
    }

    fn fail_ack(&self, frame: &Frame, err: AckError) {
        if let Some(id) = frame.ack_id {
            if let Some(tx) = self.ack_table.lock().remove(&id) {
                tx.send(Err(err)).ok();
            }
        }
    }

    fn fire_local(&self, event: &str, data: Value) {
        let handler = self.handlers.read().get(event).cloned();
        if let Some(handler) = handler {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(data, None)))
                .is_err()
            {
                error!(event, "handler panicked");
            }
        }
    }

    fn handle_frame(
        inner: &Arc<ClientInner>,
        frame: Frame,
        tx: &mpsc::UnboundedSender<Message>,
    ) -> FrameAction {
        match frame.ty {
            FrameType::Connect => {
                if let Ok(sid) =
                    serde_json::from_value::<SocketId>(frame.payload.json()["sid"].clone())
                {
                    debug!(%sid, "bound to namespace");
                    *inner.socket_id.write() = Some(sid);
                }
                FrameAction::None
            }
            FrameType::Event => {
                let ack = frame
                    .ack_id
                    .map(|id| AckResponder::new(Arc::clone(inner), id));
                let handler = inner.handlers.read().get(&frame.event).cloned();
                match handler {
                    Some(handler) => {
                        let data = frame.payload.into_json();
                        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            handler(data, ack)
                        }))
                        .is_err()
                        {
                            error!(event = %frame.event, "handler panicked");
                        }
                    }
                    None => debug!(event = %frame.event, "no handler registered, dropping event"),
                }
                FrameAction::None
            }
            FrameType::Ack => {
                if let Some(id) = frame.ack_id {
                    if let Some(tx) = inner.ack_table.lock().remove(&id) {
                        tx.send(Ok(frame.payload.into_json())).ok();
                    } else {
                        debug!(ack_id = id, "ack for unknown or reaped id, dropping");
                    }
                }
                FrameAction::None
            }
            FrameType::Heartbeat => {
                // server-side probe, answer right away
                if let Ok(bytes) = codec::encode(&Frame::heartbeat_ack(), &inner.config.codec) {
                    tx.send(Message::Binary(bytes.to_vec())).ok();
                }
                FrameAction::None
            }
            FrameType::HeartbeatAck => FrameAction::Pong,
            FrameType::Error => {
                warn!(payload = %frame.payload.json(), "error frame from server");
                inner.fire_local("error", frame.payload.into_json());
                FrameAction::None
            }
            FrameType::Disconnect => FrameAction::ServerDisconnect,
        }
    }
}

/// The driver: runs sessions and owns the backoff loop between them.
async fn drive(inner: Arc<ClientInner>, first: WsStream) {
    let mut next = Some(first);
    let mut was_reconnect = false;

    while let Some(ws) = next.take() {
        let end = run_session(&inner, ws, was_reconnect).await;
        was_reconnect = true;
        inner.send_tx.write().take();
        inner.fire_local("disconnected", Value::Null);

        if inner.user_closed.load(Ordering::SeqCst) {
            inner.state.write().mark_closed();
            return;
        }
        if let SessionEnd::ServerDisconnect = end {
            info!("server detached the client");
            inner.state.write().mark_closed();
            return;
        }

        // backoff loop until a dial succeeds or the budget runs out
        loop {
            let attempt = {
                let mut state = inner.state.write();
                let attempt = state.reconnect_attempts;
                if !inner.config.should_reconnect(attempt) {
                    state.mark_closed();
                    None
                } else {
                    state.mark_reconnecting();
                    Some(attempt)
                }
            };
            let Some(attempt) = attempt else {
                warn!("reconnect attempts exhausted");
                inner.fire_local(
                    "max_reconnect_reached",
                    json!({ "attempts": inner.config.max_reconnect_attempts }),
                );
                return;
            };

            tokio::time::sleep(inner.config.reconnect_delay_for(attempt)).await;
            if inner.user_closed.load(Ordering::SeqCst) {
                inner.state.write().mark_closed();
                return;
            }
            match ClientInner::dial(&inner).await {
                Ok(ws) => {
                    next = Some(ws);
                    break;
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "reconnect attempt failed");
                }
            }
        }
    }
}

async fn run_session(inner: &Arc<ClientInner>, ws: WsStream, was_reconnect: bool) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Flush the offline queue into the channel before publishing the sender
    // handle, so queued frames precede anything emitted from now on. The
    // queue lock is held across the publish; see dispatch_out.
    {
        let mut queue = inner.queue.lock();
        let (fresh, expired) = queue.drain(Instant::now());
        if !fresh.is_empty() || !expired.is_empty() {
            debug!(
                flushed = fresh.len(),
                expired = expired.len(),
                "flushing offline queue"
            );
        }
        for entry in &expired {
            inner.fail_ack(&entry.frame, AckError::Timeout);
        }
        for frame in fresh {
            match codec::encode(&frame, &inner.config.codec) {
                Ok(bytes) => {
                    tx.send(Message::Binary(bytes.to_vec())).ok();
                    // queued ack timers start now that the frame is sent
                    if let Some(id) = frame.ack_id {
                        inner.spawn_ack_reaper(id);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "dropping undecodable queued frame");
                    inner.fail_ack(&frame, AckError::Closed);
                }
            }
        }
        *inner.send_tx.write() = Some(tx.clone());
    }

    inner.state.write().mark_open();
    inner.fire_local(
        if was_reconnect { "reconnected" } else { "connected" },
        Value::Null,
    );

    let mut heartbeat = tokio::time::interval(inner.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heartbeat.tick().await; // the first tick completes immediately

    let mut missed: u32 = 0;
    let mut pong_deadline: Option<tokio::time::Instant> = None;
    let far_future = || tokio::time::Instant::now() + Duration::from_secs(3600);

    loop {
        let pong_wait = pong_deadline.unwrap_or_else(far_future);
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(msg) => {
                        let is_close = matches!(msg, Message::Close(_));
                        if sink.send(msg).await.is_err() {
                            return SessionEnd::Lost;
                        }
                        if is_close {
                            return SessionEnd::Lost;
                        }
                    }
                    None => return SessionEnd::Lost,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Binary(data))) => {
                        match codec::decode(&data, &inner.config.codec) {
                            Ok(frame) => match ClientInner::handle_frame(inner, frame, &tx) {
                                FrameAction::None => {}
                                FrameAction::Pong => {
                                    pong_deadline = None;
                                    missed = 0;
                                }
                                FrameAction::ServerDisconnect => {
                                    return SessionEnd::ServerDisconnect;
                                }
                            },
                            Err(e) => warn!(error = %e, "dropping undecodable frame from server"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "transport error");
                        return SessionEnd::Lost;
                    }
                }
            }
            _ = heartbeat.tick() => {
                match codec::encode(&Frame::heartbeat(), &inner.config.codec) {
                    Ok(bytes) => {
                        if sink.send(Message::Binary(bytes.to_vec())).await.is_err() {
                            return SessionEnd::Lost;
                        }
                        if pong_deadline.is_none() {
                            pong_deadline =
                                Some(tokio::time::Instant::now() + inner.config.heartbeat_timeout);
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode heartbeat"),
                }
            }
            _ = tokio::time::sleep_until(pong_wait), if pong_deadline.is_some() => {
                missed += 1;
                pong_deadline = None;
                debug!(missed, "heartbeat probe unanswered");
                if missed >= HEARTBEAT_MAX_MISSES {
                    warn!("heartbeat misses exhausted, forcing reconnect");
                    return SessionEnd::Lost;
                }
            }
        }
    }
}

/// One-shot handle for answering a server event that requested an
/// acknowledgement. Calling [`send`](Self::send) more than once is a no-op
/// after the first.
pub struct AckResponder {
    inner: Arc<ClientInner>,
    ack_id: u32,
    used: AtomicBool,
}

impl AckResponder {
    fn new(inner: Arc<ClientInner>, ack_id: u32) -> Self {
        Self {
            inner,
            ack_id,
            used: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.ack_id
    }

    pub fn send<T: Serialize>(&self, data: T) -> Result<(), ClientError> {
        if self.used.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let value = serde_json::to_value(data).map_err(roomcast_core::FrameError::from)?;
        let frame = Frame::ack(self.inner.config.namespace.clone(), self.ack_id, value);
        self.inner.dispatch_out(frame)
    }
}

impl std::fmt::Debug for AckResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckResponder")
            .field("ack_id", &self.ack_id)
            .field("used", &self.used)
            .finish()
    }
}
