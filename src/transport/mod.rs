//! Network transport layer for clipboard synchronization
//!
//! This module provides fragment framing over a raw byte stream, per
//! connection sessions with handshake, and the reconnecting lifecycle that
//! keeps a session alive against a single peer.

use std::time::Duration;

use thiserror::Error;

pub mod assembler;
pub mod frame;
pub mod protocol;
pub mod reconnect;
pub mod session;

#[cfg(test)]
mod unit_tests;

pub use assembler::Assembler;
pub use frame::{FragmentHeader, Framer, FramingError, DEFAULT_MAX_FRAGMENT_SIZE, MAX_FRAGMENT_LEN};
pub use protocol::{Payload, PROTOCOL_VERSION};
pub use reconnect::{
    ConnectionLifecycle, Connector, LifecycleEvent, LifecycleState, ReconnectionConfig, Target,
    TcpConnector,
};
pub use session::{Session, SessionReader, SessionSender, SessionState, SessionWriter};

/// Transport layer errors with user-friendly messages
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection could not be established
    #[error("NP001: Connection to {target} failed: {message}. Check that the peer is running and reachable.")]
    Connection { target: String, message: String },

    /// Connection attempt timed out
    #[error("NP002: Connection to {target} timed out after {timeout:?}.")]
    Timeout { target: String, timeout: Duration },

    /// Stream framing was corrupt
    #[error("NP003: Corrupt message framing: {0}. The stream is out of sync with the peer.")]
    Framing(#[from] FramingError),

    /// Message could not be encrypted or decrypted
    #[error("NP004: {0}. Make sure both peers use the same passphrase.")]
    Crypto(#[from] crate::crypto::CryptoError),

    /// Decrypted message was not valid UTF-8 text
    #[error("NP005: Peer sent a message that is not valid text.")]
    InvalidEncoding,

    /// IO error on the stream
    #[error("NP006: Network I/O error: {0}.")]
    Io(#[from] std::io::Error),

    /// Operation on a session that is no longer open
    #[error("NP007: Connection closed. The peer went away or the network dropped.")]
    ConnectionClosed,

    /// Reconnection gave up
    #[error("NP008: Reconnection failed: {message}.")]
    Reconnection { message: String },
}

impl TransportError {
    /// Whether the error came from corrupt stream framing
    pub fn is_framing(&self) -> bool {
        matches!(self, TransportError::Framing(_))
    }
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Configuration for sessions
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum fragment body size on send (default: 64KB)
    pub max_fragment_size: usize,

    /// Upper bound on a reassembled inbound message (default: none)
    pub max_message_size: Option<usize>,

    /// Size of a single stream read (default: 8KB)
    pub read_buffer_size: usize,

    /// Connection timeout (default: 10 seconds)
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            max_message_size: None,
            read_buffer_size: 8 * 1024,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    /// Framer matching this configuration
    pub fn framer(&self) -> std::result::Result<Framer, FramingError> {
        Framer::new(self.max_fragment_size)
    }

    /// Fresh assembler matching this configuration
    pub fn assembler(&self) -> Assembler {
        match self.max_message_size {
            Some(max) => Assembler::with_max_message_size(max),
            None => Assembler::new(),
        }
    }
}
