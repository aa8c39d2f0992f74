//! Message framing and encoding/decoding for the peer mesh.
//!
//! This crate provides the wire format spoken between mesh nodes: a
//! length-prefixed frame holding a one-byte message type and an optional
//! UTF-8 payload, plus an incremental decoder that tolerates frames split
//! across arbitrary TCP reads.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len (BE)   | length of bytes that follow|
//! +----------------------+----------------------------+
//! | u8 type              | HELLO, BYE, ELECTION, ...  |
//! +----------------------+----------------------------+
//! | data                 | UTF-8, usually JSON (0..N) |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;

// Re-export main types
pub use codec::{build_bye, build_hello, HelloPayload, TermPayload};
pub use error::WireError;
pub use frame::{Message, MessageDecoder, MAX_FRAME_SIZE};
pub use header::{MessageType, LENGTH_PREFIX_SIZE, TYPE_TAG_SIZE};
