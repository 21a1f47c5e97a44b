//! Connection bookkeeping and outbound fan-out
//!
//! This module owns the server-side view of every live transport
//! connection:
//! - connection id allocation and lifecycle (open, bind, purge)
//! - the connection -> player binding ("connected but not yet joined" is
//!   an unbound entry)
//! - the per-connection outbound sender feeding each socket's writer task
//! - the broadcast primitives used by command handlers and session tickers
//!
//! Broadcast policy: game and lobby events go to lobby members only via
//! `broadcast_to_lobby`; `broadcast_global` exists solely for lobby-list
//! refreshes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use shared::frames::ServerFrame;

pub type ConnId = u64;

/// A live transport connection and its optional player binding.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    pub addr: SocketAddr,
    pub sender: mpsc::UnboundedSender<Message>,
    /// Bound user, set on a successful create/join.
    pub user_id: Option<u64>,
    /// Lobby the bound user currently occupies.
    pub lobby_id: Option<u64>,
}

/// Map of live connections, shared between the accept loop, command
/// handlers, and session tickers.
pub struct ConnectionRegistry {
    connections: HashMap<ConnId, Connection>,
    next_id: ConnId,
}

pub type SharedRegistry = Arc<RwLock<ConnectionRegistry>>;

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry {
            connections: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(ConnectionRegistry::new()))
    }

    /// Registers a freshly accepted connection, unbound.
    pub fn add(&mut self, addr: SocketAddr, sender: mpsc::UnboundedSender<Message>) -> ConnId {
        let id = self.next_id;
        self.next_id += 1;
        self.connections.insert(
            id,
            Connection {
                id,
                addr,
                sender,
                user_id: None,
                lobby_id: None,
            },
        );
        debug!("connection {} opened from {}", id, addr);
        id
    }

    /// Purges a closed connection, returning its final binding.
    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        let removed = self.connections.remove(&id);
        if removed.is_some() {
            debug!("connection {} purged", id);
        }
        removed
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Binds a connection to a player inside a lobby. A rebind replaces
    /// the previous binding (reconnect path).
    pub fn bind(&mut self, id: ConnId, user_id: u64, lobby_id: u64) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.user_id = Some(user_id);
            conn.lobby_id = Some(lobby_id);
        }
    }

    /// Clears the lobby half of a binding when the player leaves; identity
    /// stays with the connection.
    pub fn unbind_lobby(&mut self, id: ConnId) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.lobby_id = None;
        }
    }

    pub fn find_by_user(&self, user_id: u64) -> Option<ConnId> {
        self.connections
            .iter()
            .find(|(_, conn)| conn.user_id == Some(user_id))
            .map(|(id, _)| *id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Sends one frame to one connection. Delivery failure means the
    /// socket's writer is gone; the entry is purged on transport close, so
    /// a failed send is only logged here.
    pub fn send_to(&self, id: ConnId, frame: &ServerFrame) {
        let Some(conn) = self.connections.get(&id) else {
            return;
        };
        let Some(message) = encode(frame) else {
            return;
        };
        if conn.sender.send(message).is_err() {
            debug!("connection {} write channel closed", id);
        }
    }

    pub fn send_to_user(&self, user_id: u64, frame: &ServerFrame) {
        if let Some(id) = self.find_by_user(user_id) {
            self.send_to(id, frame);
        }
    }

    /// Fans one frame out to every connection bound to the lobby.
    pub fn broadcast_to_lobby(&self, lobby_id: u64, frame: &ServerFrame) {
        let Some(message) = encode(frame) else {
            return;
        };
        for conn in self
            .connections
            .values()
            .filter(|c| c.lobby_id == Some(lobby_id))
        {
            if conn.sender.send(message.clone()).is_err() {
                debug!("connection {} write channel closed", conn.id);
            }
        }
    }

    /// Fans one frame out to every live connection, joined or not. Used
    /// only for lobby-list refreshes.
    pub fn broadcast_global(&self, frame: &ServerFrame) {
        let Some(message) = encode(frame) else {
            return;
        };
        for conn in self.connections.values() {
            if conn.sender.send(message.clone()).is_err() {
                debug!("connection {} write channel closed", conn.id);
            }
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(frame: &ServerFrame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            warn!("failed to encode outbound frame: {}", e);
            None
        }
    }
}
