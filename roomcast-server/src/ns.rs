//! A [`Namespace`] is a routing scope identified by a path beginning with
//! `/`. It owns its handler table, middleware chain, room index and
//! membership set. Namespaces are registered before the server starts
//! accepting connections; an upgrade naming an unknown path is rejected.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock, Weak},
};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

use roomcast_core::{is_reserved_event, SocketId};

use crate::{
    config::ServerConfig,
    errors::BroadcastError,
    handler::{AckSender, ConnectHandler, DisconnectHandler, MessageHandler, Middleware},
    operators::{BroadcastOperators, RoomParam},
    rooms::RoomIndex,
    server::ServerInner,
    socket::{DisconnectReason, Socket},
};

pub struct Namespace {
    path: String,
    pub(crate) config: Arc<ServerConfig>,
    /// The room index, readable by application code for membership
    /// snapshots.
    pub rooms: RoomIndex,
    server: Weak<ServerInner>,
    this: Weak<Namespace>,
    sockets: RwLock<HashMap<SocketId, Arc<Socket>>>,
    handlers: RwLock<HashMap<String, MessageHandler>>,
    middleware: RwLock<Vec<Middleware>>,
    connect_handlers: RwLock<Vec<ConnectHandler>>,
    disconnect_handlers: RwLock<Vec<DisconnectHandler>>,
}

impl Namespace {
    pub(crate) fn new(
        path: String,
        config: Arc<ServerConfig>,
        server: Weak<ServerInner>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            path,
            config,
            rooms: RoomIndex::new(),
            server,
            this: this.clone(),
            sockets: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            middleware: RwLock::new(Vec::new()),
            connect_handlers: RwLock::new(Vec::new()),
            disconnect_handlers: RwLock::new(Vec::new()),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// A strong handle to this namespace. Always succeeds while a method
    /// on `self` is running.
    fn arc(&self) -> Arc<Namespace> {
        self.this.upgrade().unwrap()
    }

    /// Registers a handler for `event`.
    ///
    /// # Panics
    /// Panics when `event` is one of the reserved names; lifecycle events go
    /// through [`on_connect`](Self::on_connect) /
    /// [`on_disconnect`](Self::on_disconnect) instead.
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

    /// Registers a handler invoked with each socket that attaches to this
    /// namespace.
    pub fn on_connect(&self, handler: impl Fn(Arc<Socket>) + Send + Sync + 'static) {
        self.connect_handlers
            .write()
            .unwrap()
            .push(Arc::new(handler));
    }

    /// Registers a handler invoked with each socket that detaches.
    pub fn on_disconnect(
        &self,
        handler: impl Fn(Arc<Socket>, DisconnectReason) + Send + Sync + 'static,
    ) {
        self.disconnect_handlers
            .write()
            .unwrap()
            .push(Arc::new(handler));
    }

    /// Appends a middleware to the chain. Middleware run in registration
    /// order before every event handler; the first rejection wins.
    pub fn use_middleware(
        &self,
        middleware: impl Fn(&Arc<Socket>, &str, &Value) -> Result<(), roomcast_core::ErrorPayload>
            + Send
            + Sync
            + 'static,
    ) {
        self.middleware.write().unwrap().push(Arc::new(middleware));
    }

    /// Emits an event to every socket in the namespace, sender included.
    pub fn emit<T: Serialize>(
        &self,
        event: impl Into<String>,
        data: T,
    ) -> Result<(), BroadcastError> {
        BroadcastOperators::new(self.arc()).emit(event, data)
    }

    /// Selects every socket in the given rooms, sender included.
    pub fn to(&self, rooms: impl RoomParam) -> BroadcastOperators {
        BroadcastOperators::new(self.arc()).to(rooms)
    }

    /// Number of sockets currently attached.
    pub fn len(&self) -> usize {
        self.sockets.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.read().unwrap().is_empty()
    }

    pub fn get_socket(&self, sid: SocketId) -> Option<Arc<Socket>> {
        self.sockets.read().unwrap().get(&sid).cloned()
    }

    pub fn sockets(&self) -> Vec<Arc<Socket>> {
        self.sockets.read().unwrap().values().cloned().collect()
    }

    pub(crate) fn insert_socket(&self, socket: Arc<Socket>) {
        self.sockets.write().unwrap().insert(socket.id, socket);
    }

    /// Detaches a socket: membership, rooms, then the disconnect handlers.
    pub(crate) fn remove_socket(&self, socket: Arc<Socket>, reason: DisconnectReason) {
        let removed = self.sockets.write().unwrap().remove(&socket.id).is_some();
        self.rooms.cleanup(&socket);
        if !removed {
            return;
        }
        debug!(sid = %socket.id, ns = %self.path, %reason, "socket detached");
        let handlers = self.disconnect_handlers.read().unwrap().clone();
        for handler in handlers {
            let socket = Arc::clone(&socket);
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(socket, reason)))
                .is_err()
            {
                error!(ns = %self.path, "disconnect handler panicked");
            }
        }
    }

    /// Runs the connect handlers for a freshly attached socket.
    pub(crate) fn fire_connect(&self, socket: &Arc<Socket>) {
        let handlers = self.connect_handlers.read().unwrap().clone();
        for handler in handlers {
            let socket = Arc::clone(socket);
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(socket))).is_err()
            {
                error!(ns = %self.path, "connect handler panicked");
            }
        }
    }

    pub(crate) fn handler(&self, event: &str) -> Option<MessageHandler> {
        self.handlers.read().unwrap().get(event).cloned()
    }

    pub(crate) fn server_handler(&self, event: &str) -> Option<MessageHandler> {
        self.server.upgrade().and_then(|s| s.global_handler(event))
    }

    pub(crate) fn middleware_snapshot(&self) -> Vec<Middleware> {
        self.middleware.read().unwrap().clone()
    }

    /// Closes every socket in the namespace. Used on server shutdown.
    pub(crate) fn close_all(&self, reason: DisconnectReason) {
        let sockets = self.sockets();
        debug!(ns = %self.path, count = sockets.len(), "closing all sockets in namespace");
        for socket in sockets {
            socket.close(reason);
        }
        self.sockets.write().unwrap().shrink_to_fit();
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("path", &self.path)
            .field("sockets", &self.sockets.read().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
impl Namespace {
    pub(crate) fn new_dummy(path: &str) -> Arc<Self> {
        Namespace::new(
            path.to_owned(),
            Arc::new(ServerConfig::default()),
            Weak::new(),
        )
    }
}
