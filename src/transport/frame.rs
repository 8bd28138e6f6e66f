//! Outbound framing of encrypted messages
//!
//! A message is split into one or more fragments so that the receiving
//! [`Assembler`](super::assembler::Assembler) can recover message boundaries
//! from a raw byte stream.
//!
//! # Fragment Format
//!
//! ```text
//! +-----------------+
//! | magic (1 byte)  |  0x4E ('N')
//! +-----------------+
//! | flags (1 byte)  |  bit 0: FIN (last fragment of a message)
//! +-----------------+  bits 1..7: reserved, must be zero
//! | length (4)      |  u32 big-endian, body length, 1..=MAX_FRAGMENT_LEN
//! +-----------------+
//! | body            |  `length` bytes of the encrypted message
//! | (variable)      |
//! +-----------------+
//! ```

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::Result;

/// First byte of every fragment header
pub const FRAGMENT_MAGIC: u8 = 0x4E;

/// Flag bit marking the last fragment of a message
pub const FLAG_FIN: u8 = 0b0000_0001;

/// Size of the fragment header in bytes
pub const HEADER_LEN: usize = 6;

/// Hard protocol cap on a single fragment body (16MB)
pub const MAX_FRAGMENT_LEN: usize = 16 * 1024 * 1024;

/// Default maximum fragment body size (64KB)
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 64 * 1024;

/// Errors raised while framing or reassembling messages
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// Header does not start with the fragment magic byte
    #[error("invalid fragment magic: expected {expected:#04x}, found {found:#04x}")]
    InvalidMagic { expected: u8, found: u8 },

    /// Reserved flag bits are set
    #[error("reserved fragment flags set: {flags:#010b}")]
    ReservedFlags { flags: u8 },

    /// Fragment declares an empty body
    #[error("fragment declares an empty body")]
    EmptyFragment,

    /// Fragment body exceeds the protocol cap
    #[error("fragment of {len} bytes exceeds the {max} byte limit")]
    FragmentTooLarge { len: usize, max: usize },

    /// Reassembled message exceeds the configured limit
    #[error("message of at least {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },

    /// Attempt to frame an empty payload
    #[error("cannot frame an empty payload")]
    EmptyPayload,

    /// Maximum fragment size outside of 1..=MAX_FRAGMENT_LEN
    #[error("invalid maximum fragment size {0}: must be between 1 and {MAX_FRAGMENT_LEN}")]
    InvalidFragmentSize(usize),
}

/// Decoded fragment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Body length in bytes
    pub len: usize,

    /// Whether this fragment completes its message
    pub is_final: bool,
}

impl FragmentHeader {
    /// Encode the header into `dst`
    pub fn put(&self, dst: &mut impl BufMut) {
        dst.put_u8(FRAGMENT_MAGIC);
        dst.put_u8(if self.is_final { FLAG_FIN } else { 0 });
        dst.put_u32(self.len as u32);
    }

    /// Encode the header into a fixed array
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = FRAGMENT_MAGIC;
        out[1] = if self.is_final { FLAG_FIN } else { 0 };
        out[2..].copy_from_slice(&(self.len as u32).to_be_bytes());
        out
    }

    /// Decode and validate a header from the start of `src`.
    ///
    /// Returns `Ok(None)` while fewer than [`HEADER_LEN`] bytes are available.
    pub fn parse(src: &[u8]) -> std::result::Result<Option<Self>, FramingError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        if src[0] != FRAGMENT_MAGIC {
            return Err(FramingError::InvalidMagic {
                expected: FRAGMENT_MAGIC,
                found: src[0],
            });
        }

        let flags = src[1];
        if flags & !FLAG_FIN != 0 {
            return Err(FramingError::ReservedFlags { flags });
        }

        let len = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;
        if len == 0 {
            return Err(FramingError::EmptyFragment);
        }
        if len > MAX_FRAGMENT_LEN {
            return Err(FramingError::FragmentTooLarge {
                len,
                max: MAX_FRAGMENT_LEN,
            });
        }

        Ok(Some(Self {
            len,
            is_final: flags & FLAG_FIN != 0,
        }))
    }
}

/// Splits messages into fragments of at most `max_fragment_size` bytes
#[derive(Debug, Clone)]
pub struct Framer {
    max_fragment_size: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Self {
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
        }
    }
}

impl Framer {
    /// Create a framer with the given maximum fragment body size
    pub fn new(max_fragment_size: usize) -> std::result::Result<Self, FramingError> {
        if max_fragment_size == 0 || max_fragment_size > MAX_FRAGMENT_LEN {
            return Err(FramingError::InvalidFragmentSize(max_fragment_size));
        }
        Ok(Self { max_fragment_size })
    }

    /// Maximum fragment body size
    pub fn max_fragment_size(&self) -> usize {
        self.max_fragment_size
    }

    /// Number of fragments a payload of `len` bytes is split into
    pub fn fragment_count(&self, len: usize) -> usize {
        len.div_ceil(self.max_fragment_size)
    }

    /// Number of bytes `payload_len` occupies on the wire
    pub fn encoded_len(&self, payload_len: usize) -> usize {
        payload_len + self.fragment_count(payload_len) * HEADER_LEN
    }

    /// Iterate over `(header, body)` pairs for a payload
    pub fn fragments<'a>(
        &self,
        payload: &'a [u8],
    ) -> impl Iterator<Item = (FragmentHeader, &'a [u8])> + 'a {
        let total = self.fragment_count(payload.len());
        payload
            .chunks(self.max_fragment_size)
            .enumerate()
            .map(move |(i, body)| {
                (
                    FragmentHeader {
                        len: body.len(),
                        is_final: i + 1 == total,
                    },
                    body,
                )
            })
    }

    /// Encode a payload into `dst` without performing any I/O
    pub fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> std::result::Result<(), FramingError> {
        if payload.is_empty() {
            return Err(FramingError::EmptyPayload);
        }

        dst.reserve(self.encoded_len(payload.len()));
        for (header, body) in self.fragments(payload) {
            header.put(dst);
            dst.put_slice(body);
        }
        Ok(())
    }

    /// Write a payload to `sink` as one or more fragments.
    ///
    /// Write errors are returned as is; retrying is up to the caller.
    pub async fn frame_and_send<W>(&self, payload: &[u8], sink: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if payload.is_empty() {
            return Err(FramingError::EmptyPayload.into());
        }

        let count = self.fragment_count(payload.len());
        for (header, body) in self.fragments(payload) {
            sink.write_all(&header.to_bytes()).await?;
            sink.write_all(body).await?;
        }
        sink.flush().await?;

        debug!("Framed {} byte message into {} fragment(s)", payload.len(), count);
        Ok(())
    }
}
