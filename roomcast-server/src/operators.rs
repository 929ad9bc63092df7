//! Broadcast selection operators.
//!
//! Operators chain with the builder pattern to select the sockets a frame
//! fans out to: rooms to include, rooms to exclude, and whether the sender
//! itself is excluded (the `socket.to(room)` broadcast variant). The frame
//! is encoded once and the same bytes are written to every selected socket,
//! the identical codec path used for direct emits.

use std::{collections::HashSet, sync::Arc};

use serde::Serialize;
use tracing::warn;

use roomcast_core::{codec, Frame, SocketId};

use crate::{
    errors::{BroadcastError, SendError},
    ns::Namespace,
    rooms::Room,
    socket::Socket,
};

/// A trait for types that can be used as a room parameter.
///
/// [`String`], [`&'static str`](str), [`Vec<String>`], [`Vec<&str>`] and
/// const arrays of both are implemented by default.
pub trait RoomParam: 'static {
    type IntoIter: Iterator<Item = Room>;

    fn into_room_iter(self) -> Self::IntoIter;
}

impl RoomParam for Room {
    type IntoIter = std::iter::Once<Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        std::iter::once(self)
    }
}
impl RoomParam for &'static str {
    type IntoIter = std::iter::Once<Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        std::iter::once(self.to_owned())
    }
}
impl RoomParam for Vec<String> {
    type IntoIter = std::vec::IntoIter<Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter()
    }
}
impl RoomParam for Vec<&'static str> {
    type IntoIter = std::iter::Map<std::vec::IntoIter<&'static str>, fn(&'static str) -> Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter().map(str::to_owned)
    }
}
impl<const COUNT: usize> RoomParam for [&'static str; COUNT] {
    type IntoIter =
        std::iter::Map<std::array::IntoIter<&'static str, COUNT>, fn(&'static str) -> Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter().map(str::to_owned)
    }
}
impl<const COUNT: usize> RoomParam for [String; COUNT] {
    type IntoIter = std::array::IntoIter<String, COUNT>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter()
    }
}

/// Chainable socket selection ending in [`emit`](Self::emit).
pub struct BroadcastOperators {
    ns: Arc<Namespace>,
    rooms: Vec<Room>,
    except_rooms: Vec<Room>,
    exclude_sender: Option<SocketId>,
}

impl BroadcastOperators {
    /// Namespace-scoped selection: the sender is included.
    pub(crate) fn new(ns: Arc<Namespace>) -> Self {
        Self {
            ns,
            rooms: Vec::new(),
            except_rooms: Vec::new(),
            exclude_sender: None,
        }
    }

    /// Socket-scoped selection: the sender is excluded.
    pub(crate) fn from_sender(ns: Arc<Namespace>, sender: SocketId) -> Self {
        Self {
            ns,
            rooms: Vec::new(),
            except_rooms: Vec::new(),
            exclude_sender: Some(sender),
        }
    }

    /// Adds rooms to the selection. With no rooms selected the whole
    /// namespace is targeted.
    pub fn to(mut self, rooms: impl RoomParam) -> Self {
        self.rooms.extend(rooms.into_room_iter());
        self
    }

    /// Filters out every socket that is in one of the given rooms.
    pub fn except(mut self, rooms: impl RoomParam) -> Self {
        self.except_rooms.extend(rooms.into_room_iter());
        self
    }

    /// Emits to every selected socket. A selection that matches no sockets
    /// (missing or empty room) is a logged no-op, not an error.
    pub fn emit<T: Serialize>(
        &self,
        event: impl Into<String>,
        data: T,
    ) -> Result<(), BroadcastError> {
        let value = serde_json::to_value(data).map_err(roomcast_core::FrameError::from)?;
        let frame = Frame::event(self.ns.path().to_owned(), event.into(), value);
        let bytes = codec::encode(&frame, &self.ns.config.codec)?;

        let targets = self.select();
        if targets.is_empty() {
            warn!(
                ns = %self.ns.path(),
                rooms = ?self.rooms,
                event = %frame.event,
                "broadcast matched no sockets"
            );
            return Ok(());
        }

        let errors: Vec<SendError> = targets
            .iter()
            .filter_map(|socket| socket.send_raw(bytes.clone()).err())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }

    /// The sockets the current selection resolves to, as a snapshot taken
    /// at call time.
    pub(crate) fn select(&self) -> Vec<Arc<Socket>> {
        let except: HashSet<SocketId> = self
            .except_rooms
            .iter()
            .flat_map(|room| self.ns.rooms.members(room))
            .collect();

        let keep = |sid: SocketId| !except.contains(&sid) && Some(sid) != self.exclude_sender;

        if self.rooms.is_empty() {
            self.ns
                .sockets()
                .into_iter()
                .filter(|socket| keep(socket.id))
                .collect()
        } else {
            let mut seen = HashSet::new();
            self.rooms
                .iter()
                .flat_map(|room| self.ns.rooms.members(room))
                .filter(|sid| seen.insert(*sid) && keep(*sid))
                .filter_map(|sid| self.ns.get_socket(sid))
                .collect()
        }
    }
}
