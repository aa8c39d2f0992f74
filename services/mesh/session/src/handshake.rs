//! HELLO handshake for mesh connections.
//!
//! An outbound connection knows its peer before the socket exists and
//! announces itself with HELLO right after connecting. An inbound
//! connection learns its peer from the first HELLO it receives; until then
//! anything else on the socket is a protocol violation.

use crate::connection::Direction;
use crate::peer::{Peer, PeerDirectory};
use mesh_wire::{Message, MessageType};
use std::sync::Arc;
use thiserror::Error;

/// Reasons a connection is ended during or after the handshake
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// HELLO arrived without a payload
    #[error("HELLO without payload")]
    EmptyHello,

    /// HELLO payload is not a valid hello object
    #[error("invalid HELLO payload: {0}")]
    InvalidHello(String),

    /// HELLO names a node that is not in the directory
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// HELLO names this node
    #[error("HELLO from own name {0}")]
    SelfHello(String),

    /// A non-HELLO message arrived before the socket was bound
    #[error("{0} before HELLO")]
    Unauthenticated(MessageType),

    /// Remote side said goodbye
    #[error("BYE received")]
    Bye,
}

/// What to do with a received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Bind the connection to this peer
    Bind(Arc<Peer>),
    /// Deliver the message as coming from this peer
    Deliver(Arc<Peer>),
    /// Drop the message
    Ignore,
    /// End the connection
    End(HandshakeError),
}

/// Handshake rules for one node
#[derive(Debug, Clone)]
pub struct Handshake {
    own_name: String,
    directory: Arc<PeerDirectory>,
}

impl Handshake {
    /// Create the handshake rules for `own_name`
    pub fn new(own_name: impl Into<String>, directory: Arc<PeerDirectory>) -> Self {
        Self {
            own_name: own_name.into(),
            directory,
        }
    }

    /// Decide what a message means for a connection.
    ///
    /// `bound` is the peer the connection is currently bound to, if any.
    /// A HELLO on an inbound connection always rebinds: the latest HELLO wins.
    pub fn evaluate(
        &self,
        direction: Direction,
        bound: Option<&Arc<Peer>>,
        message: &Message,
    ) -> HandshakeAction {
        if !message.typ.is_control() {
            return match bound {
                Some(peer) => HandshakeAction::Deliver(peer.clone()),
                None => HandshakeAction::End(HandshakeError::Unauthenticated(message.typ)),
            };
        }

        match (message.typ, direction) {
            (MessageType::Hello, Direction::Inbound) => match self.identify(message) {
                Ok(peer) => HandshakeAction::Bind(peer),
                Err(e) => HandshakeAction::End(e),
            },
            (MessageType::Hello, Direction::Outbound) => HandshakeAction::Ignore,
            _ => HandshakeAction::End(HandshakeError::Bye),
        }
    }

    fn identify(&self, hello: &Message) -> Result<Arc<Peer>, HandshakeError> {
        let payload = hello
            .hello_payload()
            .map_err(|e| HandshakeError::InvalidHello(e.to_string()))?
            .ok_or(HandshakeError::EmptyHello)?;

        if payload.name == self.own_name {
            return Err(HandshakeError::SelfHello(payload.name));
        }

        self.directory
            .get(&payload.name)
            .cloned()
            .ok_or(HandshakeError::UnknownPeer(payload.name))
    }
}
