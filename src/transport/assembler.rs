//! Inbound reassembly of fragmented messages
//!
//! Bytes arrive from the stream in arbitrary chunks. The assembler buffers
//! them, peels off complete fragments and concatenates fragment bodies until
//! a FIN fragment completes the message.

use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use super::frame::{FragmentHeader, FramingError, HEADER_LEN};

/// Per-session reassembly state
#[derive(Debug, Default)]
pub struct Assembler {
    /// Raw bytes not yet consumed as whole fragments
    buffer: BytesMut,

    /// Bodies of the fragments received so far for the current message
    message: BytesMut,

    /// Optional upper bound on a reassembled message
    max_message_size: Option<usize>,
}

impl Assembler {
    /// Create an assembler without a message size limit
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an assembler that rejects messages larger than `max` bytes
    pub fn with_max_message_size(max: usize) -> Self {
        Self {
            max_message_size: Some(max),
            ..Self::default()
        }
    }

    /// Feed the next chunk read from the stream.
    ///
    /// `on_message` is called once per message completed by this chunk, in
    /// stream order, before this method returns. Returns how many messages
    /// were delivered.
    pub fn add_data<F>(&mut self, chunk: &[u8], mut on_message: F) -> Result<usize, FramingError>
    where
        F: FnMut(Bytes),
    {
        self.buffer.extend_from_slice(chunk);
        let mut delivered = 0;

        while let Some(header) = FragmentHeader::parse(&self.buffer)? {
            if let Some(max) = self.max_message_size {
                let size = self.message.len() + header.len;
                if size > max {
                    return Err(FramingError::MessageTooLarge { size, max });
                }
            }

            if self.buffer.len() < HEADER_LEN + header.len {
                break;
            }

            self.buffer.advance(HEADER_LEN);
            let body = self.buffer.split_to(header.len);
            self.message.extend_from_slice(&body);
            trace!("Reassembled fragment of {} bytes (fin: {})", header.len, header.is_final);

            if header.is_final {
                on_message(self.message.split().freeze());
                delivered += 1;
            }
        }

        Ok(delivered)
    }

    /// Bytes held for a message that is not complete yet
    pub fn pending_len(&self) -> usize {
        self.buffer.len() + self.message.len()
    }

    /// Whether a partially received message is buffered
    pub fn has_partial(&self) -> bool {
        self.pending_len() > 0
    }

    /// Drop all buffered state
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.message.clear();
    }
}
