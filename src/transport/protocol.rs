//! Plaintext message kinds carried inside encrypted messages
//!
//! Every decrypted message starts with a tag that tells the peer how to
//! route it. The tags are part of the wire contract with other netpaste
//! peers and must not change.

use std::fmt;

/// Protocol version announced in the handshake banner
pub const PROTOCOL_VERSION: &str = "1.0";

/// Tag of the handshake sent first on every session
pub const HELLO_TAG: &str = "NETPASTE_HELLO:";

/// Tag of a clipboard content update
pub const UPDATE_TAG: &str = "NETPASTE_UPDATE:";

/// Banner sent in the handshake by this client
pub fn client_banner() -> String {
    format!("Netpaste client v{}", PROTOCOL_VERSION)
}

/// A decoded plaintext message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Session greeting carrying the sender's banner
    Hello(String),

    /// New clipboard content
    Update(String),
}

impl Payload {
    /// Handshake payload for this client
    pub fn hello() -> Self {
        Payload::Hello(client_banner())
    }

    /// Serialize to the tagged plaintext form
    pub fn encode(&self) -> String {
        match self {
            Payload::Hello(banner) => format!("{}{}", HELLO_TAG, banner),
            Payload::Update(content) => format!("{}{}", UPDATE_TAG, content),
        }
    }

    /// Parse tagged plaintext. Returns `None` for unknown tags.
    pub fn decode(plaintext: &str) -> Option<Self> {
        if let Some(banner) = plaintext.strip_prefix(HELLO_TAG) {
            Some(Payload::Hello(banner.to_string()))
        } else {
            plaintext
                .strip_prefix(UPDATE_TAG)
                .map(|content| Payload::Update(content.to_string()))
        }
    }

    /// Short name of the message kind for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Hello(_) => "hello",
            Payload::Update(_) => "update",
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print clipboard content; it can hold secrets
        match self {
            Payload::Hello(banner) => write!(f, "hello ({})", banner),
            Payload::Update(content) => write!(f, "update ({} characters)", content.chars().count()),
        }
    }
}
