//! # netpaste
//!
//! Two-way clipboard synchronization with a single remote peer.
//!
//! Local clipboard changes are encrypted, split into fragments and sent over
//! a persistent TCP connection; updates from the peer are reassembled,
//! decrypted and written back into the clipboard without being echoed. The
//! connection is re-established whenever it drops.

pub mod cli;
pub mod clipboard;
pub mod config;
pub mod crypto;
pub mod passphrase;
pub mod progress;
pub mod sync;
pub mod transport;

pub use config::Config;

/// Result type alias for netpaste operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for netpaste operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Clipboard operation error
    #[error("Clipboard error: {0}")]
    Clipboard(#[from] clipboard::ClipboardError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    /// Encryption error
    #[error("Encryption error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    /// Passphrase error
    #[error("{0}")]
    Passphrase(#[from] passphrase::PassphraseError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Port used when none is configured
pub const DEFAULT_PORT: u16 = 8484;
