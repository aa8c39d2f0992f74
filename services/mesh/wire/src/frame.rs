//! Message framing for the wire protocol.
//!
//! This module provides the message structure and the incremental decoder
//! that pulls complete frames off the front of a byte buffer.

use crate::header::{MessageType, LENGTH_PREFIX_SIZE, TYPE_TAG_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

/// Maximum frame size (1 MiB default)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Decoded protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type
    pub typ: MessageType,
    /// Optional UTF-8 payload, usually JSON
    pub data: Option<String>,
}

impl Message {
    /// Create a new message
    pub fn new(typ: MessageType, data: Option<String>) -> Self {
        // An empty payload is not distinguishable from no payload on the wire
        let data = data.filter(|d| !d.is_empty());
        Self { typ, data }
    }

    /// Create a message with a JSON-serialized payload
    pub fn with_json<T: Serialize>(typ: MessageType, payload: &T) -> Result<Self, crate::WireError> {
        let data = serde_json::to_string(payload)?;
        Ok(Self::new(typ, Some(data)))
    }

    /// Deserialize the JSON payload, if any
    pub fn json<T: DeserializeOwned>(&self) -> Result<Option<T>, crate::WireError> {
        match self.data.as_deref() {
            Some(data) => Ok(Some(serde_json::from_str(data)?)),
            None => Ok(None),
        }
    }

    /// Get the total frame size when encoded
    pub fn encoded_size(&self) -> usize {
        LENGTH_PREFIX_SIZE + TYPE_TAG_SIZE + self.data.as_ref().map_or(0, String::len)
    }

    /// Encode the message with the default size limit
    pub fn encode(&self) -> Result<Bytes, crate::WireError> {
        self.encode_with_limit(MAX_FRAME_SIZE)
    }

    /// Encode the message to a contiguous buffer
    pub fn encode_with_limit(&self, max_frame_size: usize) -> Result<Bytes, crate::WireError> {
        let total_size = self.encoded_size();
        if total_size > max_frame_size {
            return Err(crate::WireError::Size(total_size));
        }

        let mut buf = BytesMut::with_capacity(total_size);

        // Frame length (everything after this u32)
        buf.put_u32((total_size - LENGTH_PREFIX_SIZE) as u32);
        buf.put_u8(self.typ.tag());
        if let Some(ref data) = self.data {
            buf.put_slice(data.as_bytes());
        }

        Ok(buf.freeze())
    }
}

/// Frame decoder for parsing incoming messages
#[derive(Debug)]
pub struct MessageDecoder {
    max_frame_size: usize,
}

impl MessageDecoder {
    /// Create a new decoder with the default size limit
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a decoder with a custom size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode one message from the front of a buffer.
    ///
    /// Returns `Ok(None)` without consuming anything when the buffer does not
    /// yet hold a complete frame. On success the frame is removed from `buf`
    /// and whatever follows it stays in place.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, crate::WireError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        // Peek at frame length
        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if frame_len == 0 {
            return Err(crate::WireError::Empty);
        }
        if LENGTH_PREFIX_SIZE + frame_len > self.max_frame_size {
            return Err(crate::WireError::Size(frame_len));
        }

        if buf.len() < LENGTH_PREFIX_SIZE + frame_len {
            trace!(
                "Incomplete frame: have {} of {} bytes",
                buf.len(),
                LENGTH_PREFIX_SIZE + frame_len
            );
            return Ok(None);
        }

        let typ = MessageType::from(buf[LENGTH_PREFIX_SIZE]);
        let payload = &buf[LENGTH_PREFIX_SIZE + TYPE_TAG_SIZE..LENGTH_PREFIX_SIZE + frame_len];
        let data = if payload.is_empty() {
            None
        } else {
            // Validated before consuming so a bad frame leaves the buffer intact
            let text = std::str::from_utf8(payload).map_err(|_| crate::WireError::Utf8)?;
            Some(text.to_owned())
        };

        buf.advance(LENGTH_PREFIX_SIZE + frame_len);

        Ok(Some(Message { typ, data }))
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}
