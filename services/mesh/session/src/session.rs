//! Per-peer session state and the session store.
//!
//! A session outlives any single connection: it is created once per peer
//! and only its pending buffer and bound connection change across reconnects.

use crate::connection::ConnectionId;
use crate::peer::PeerDirectory;
use bytes::BytesMut;
use std::collections::HashMap;

/// Mutable per-peer state
#[derive(Debug, Default)]
pub struct Session {
    /// Bytes received from the peer that do not yet form a complete message
    pub buffer: BytesMut,
    /// Connection currently bound to the peer
    pub socket: Option<ConnectionId>,
}

impl Session {
    /// Whether a connection is currently bound
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }
}

/// Read-only view of a session, handed out by the mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Number of bytes waiting for the rest of their frame
    pub buffered: usize,
    /// Connection currently bound to the peer
    pub socket: Option<ConnectionId>,
}

impl From<&Session> for SessionSnapshot {
    fn from(session: &Session) -> Self {
        Self {
            buffered: session.buffer.len(),
            socket: session.socket,
        }
    }
}

/// Lookup of sessions by peer name.
///
/// The mesh owns its store exclusively and touches it from a single task,
/// so implementations need no interior locking.
pub trait SessionStore: Send + 'static {
    /// Get the session for a peer
    fn get(&self, peer: &str) -> Option<&Session>;

    /// Get the session for a peer mutably
    fn get_mut(&mut self, peer: &str) -> Option<&mut Session>;
}

/// In-memory session store
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: HashMap<String, Session>,
}

impl MemorySessionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with one empty session per directory peer
    pub fn for_directory(directory: &PeerDirectory) -> Self {
        let mut store = Self::new();
        for peer in directory.iter() {
            store.insert(&peer.name);
        }
        store
    }

    /// Add an empty session for a peer, keeping any existing one
    pub fn insert(&mut self, peer: &str) {
        self.sessions.entry(peer.to_string()).or_default();
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, peer: &str) -> Option<&Session> {
        self.sessions.get(peer)
    }

    fn get_mut(&mut self, peer: &str) -> Option<&mut Session> {
        self.sessions.get_mut(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Peer;

    #[test]
    fn test_store_for_directory() {
        let directory = PeerDirectory::new(vec![
            Peer::new("a", "127.0.0.1:9000"),
            Peer::new("b", "127.0.0.1:9001"),
        ])
        .unwrap();

        let mut store = MemorySessionStore::for_directory(&directory);
        assert_eq!(store.len(), 2);
        assert!(store.get("c").is_none());

        let session = store.get_mut("a").unwrap();
        assert!(!session.is_connected());
        session.buffer.extend_from_slice(b"abc");
        session.socket = Some(ConnectionId(7));

        // Re-inserting keeps the existing session
        store.insert("a");
        let snapshot = SessionSnapshot::from(store.get("a").unwrap());
        assert_eq!(
            snapshot,
            SessionSnapshot {
                buffered: 3,
                socket: Some(ConnectionId(7)),
            }
        );
    }
}
