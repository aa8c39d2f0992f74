//! Stream reassembly: turning arbitrarily split TCP reads back into messages.
//!
//! The caller owns the pending buffer (a session buffer, or a connection's
//! own buffer before the handshake binds it to a peer). Each call appends
//! the new bytes and pulls at most one message off the front. Whatever
//! follows that message stays in the buffer, so the caller keeps calling
//! with an empty slice until nothing more comes out.

use bytes::BytesMut;
use mesh_wire::{Message, MessageDecoder, WireError};

/// Incremental message reassembler
#[derive(Debug, Default)]
pub struct Reassembler {
    decoder: MessageDecoder,
}

impl Reassembler {
    /// Create a reassembler with the default frame size limit
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a reassembler with a custom frame size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            decoder: MessageDecoder::with_max_frame_size(max_frame_size),
        }
    }

    /// Append `incoming` to `buffer` and try to decode one message.
    ///
    /// `Ok(None)` means the buffer holds an incomplete frame; nothing was
    /// consumed. After `Ok(Some(_))` the buffer holds the tail.
    pub fn reassemble(
        &mut self,
        buffer: &mut BytesMut,
        incoming: &[u8],
    ) -> Result<Option<Message>, WireError> {
        if !incoming.is_empty() {
            buffer.extend_from_slice(incoming);
        }
        self.decoder.decode(buffer)
    }
}
