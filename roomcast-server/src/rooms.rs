//! Room membership index.
//!
//! One index per namespace, mapping room id to the set of member socket ids,
//! mirrored by the `rooms` set held on each socket. The two sides are kept
//! consistent by taking the index lock before the socket's room-set lock,
//! always in that order. Readers get copied snapshots so fan-out iteration
//! is never aborted by a concurrent leave.

use std::{
    collections::{HashMap, HashSet},
    sync::RwLock,
};

use roomcast_core::SocketId;

use crate::socket::Socket;

/// A room identifier.
pub type Room = String;

#[derive(Debug, Default)]
pub struct RoomIndex {
    rooms: RwLock<HashMap<Room, HashSet<SocketId>>>,
}

impl RoomIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds the socket to the room. Joining a room twice is idempotent.
    pub(crate) fn join(&self, socket: &Socket, room: Room) {
        let mut rooms = self.rooms.write().unwrap();
        rooms.entry(room.clone()).or_default().insert(socket.id);
        socket.rooms.write().unwrap().insert(room);
    }

    /// Removes the socket from the room. Leaving a room the socket is not
    /// in is a silent no-op. A room entry exists iff it has members.
    pub(crate) fn leave(&self, socket: &Socket, room: &str) {
        let mut rooms = self.rooms.write().unwrap();
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&socket.id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
        socket.rooms.write().unwrap().remove(room);
    }

    /// A copied snapshot of the members of `room`. Empty for unknown rooms.
    pub fn members(&self, room: &str) -> Vec<SocketId> {
        self.rooms
            .read()
            .unwrap()
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// All rooms that currently have at least one member.
    pub fn rooms(&self) -> Vec<Room> {
        self.rooms.read().unwrap().keys().cloned().collect()
    }

    pub fn contains(&self, room: &str) -> bool {
        self.rooms.read().unwrap().contains_key(room)
    }

    /// Removes the socket from every room it joined, dropping rooms that
    /// become empty. Called once on disconnect.
    pub(crate) fn cleanup(&self, socket: &Socket) {
        let mut rooms = self.rooms.write().unwrap();
        let joined: Vec<Room> = socket.rooms.write().unwrap().drain().collect();
        for room in joined {
            if let Some(members) = rooms.get_mut(&room) {
                members.remove(&socket.id);
                if members.is_empty() {
                    rooms.remove(&room);
                }
            }
        }
    }
}
