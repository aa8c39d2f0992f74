//! Control message builders and JSON payload helpers.
//!
//! HELLO carries the sender's node name as a JSON object; BYE carries
//! nothing. Election messages carry whatever JSON the consensus layer puts
//! in them, so only the term-bearing shape shared by all of them is typed here.

use crate::frame::Message;
use crate::header::MessageType;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// HELLO payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Name of the sending node
    pub name: String,
}

/// Term-bearing payload used by the election messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermPayload {
    /// Election term
    pub term: u64,
}

impl Message {
    /// Build a HELLO message announcing `name`
    pub fn hello(name: &str) -> Result<Self, crate::WireError> {
        Self::with_json(
            MessageType::Hello,
            &HelloPayload {
                name: name.to_string(),
            },
        )
    }

    /// Build a BYE message
    pub fn bye() -> Self {
        Self::new(MessageType::Bye, None)
    }

    /// Build an election-family message carrying a term
    pub fn with_term(typ: MessageType, term: u64) -> Result<Self, crate::WireError> {
        Self::with_json(typ, &TermPayload { term })
    }

    /// Parse the HELLO payload. `Ok(None)` means the payload was empty.
    pub fn hello_payload(&self) -> Result<Option<HelloPayload>, crate::WireError> {
        self.json()
    }
}

/// Encode a HELLO frame ready to be written to a socket
pub fn build_hello(name: &str) -> Result<Bytes, crate::WireError> {
    Message::hello(name)?.encode()
}

/// Encode a BYE frame ready to be written to a socket
pub fn build_bye() -> Result<Bytes, crate::WireError> {
    Message::bye().encode()
}
