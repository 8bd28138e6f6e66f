//! Clipboard abstraction layer
//!
//! This module provides a platform-agnostic text clipboard interface with a
//! system implementation backed by `arboard` and an in-memory one for
//! headless use and tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{oneshot, RwLock};
use tracing::debug;

/// Clipboard errors
#[derive(Debug, Error)]
pub enum ClipboardError {
    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),

    /// Unsupported content type
    #[error("Unsupported content type: {0}")]
    UnsupportedType(String),

    /// No content available
    #[error("No clipboard content available")]
    NoContent,

    /// Clipboard service is no longer running
    #[error("Clipboard service unavailable")]
    Unavailable,
}

/// Text clipboard provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClipboardProvider: Send + Sync {
    /// Get current clipboard text
    async fn get_text(&self) -> Result<String, ClipboardError>;

    /// Replace clipboard text
    async fn set_text(&self, text: &str) -> Result<(), ClipboardError>;

    /// Get provider name
    fn name(&self) -> &'static str;
}

enum Request {
    Get(oneshot::Sender<Result<String, ClipboardError>>),
    Set(String, oneshot::Sender<Result<(), ClipboardError>>),
}

/// System clipboard owned by a dedicated thread.
///
/// The `arboard` handle stays alive for the whole process, which on X11
/// keeps ownership of the selection after a write.
pub struct SystemClipboard {
    requests: std_mpsc::Sender<Request>,
}

impl SystemClipboard {
    /// Open the system clipboard
    pub fn new() -> Result<Self, ClipboardError> {
        let (requests, inbox) = std_mpsc::channel::<Request>();
        let (ready_tx, ready_rx) = std_mpsc::channel();

        thread::Builder::new()
            .name("netpaste-clipboard".to_string())
            .spawn(move || {
                let mut clipboard = match arboard::Clipboard::new() {
                    Ok(clipboard) => {
                        let _ = ready_tx.send(Ok(()));
                        clipboard
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(map_arboard_error(e)));
                        return;
                    }
                };

                while let Ok(request) = inbox.recv() {
                    match request {
                        Request::Get(reply) => {
                            let _ = reply.send(clipboard.get_text().map_err(map_arboard_error));
                        }
                        Request::Set(text, reply) => {
                            let _ = reply.send(clipboard.set_text(text).map_err(map_arboard_error));
                        }
                    }
                }
                debug!("Clipboard thread exiting");
            })
            .map_err(|e| ClipboardError::Platform(e.to_string()))?;

        ready_rx.recv().map_err(|_| ClipboardError::Unavailable)??;
        Ok(Self { requests })
    }
}

#[async_trait]
impl ClipboardProvider for SystemClipboard {
    async fn get_text(&self) -> Result<String, ClipboardError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Get(tx))
            .map_err(|_| ClipboardError::Unavailable)?;
        rx.await.map_err(|_| ClipboardError::Unavailable)?
    }

    async fn set_text(&self, text: &str) -> Result<(), ClipboardError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Set(text.to_string(), tx))
            .map_err(|_| ClipboardError::Unavailable)?;
        rx.await.map_err(|_| ClipboardError::Unavailable)?
    }

    fn name(&self) -> &'static str {
        "system"
    }
}

fn map_arboard_error(error: arboard::Error) -> ClipboardError {
    match error {
        arboard::Error::ContentNotAvailable => ClipboardError::NoContent,
        arboard::Error::ConversionFailure => {
            ClipboardError::UnsupportedType("content is not text".to_string())
        }
        other => ClipboardError::Platform(other.to_string()),
    }
}

/// In-memory clipboard
#[derive(Default)]
pub struct MemoryClipboard {
    content: RwLock<Option<String>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryClipboard {
    /// Create an empty clipboard
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clipboard holding `text`
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            content: RwLock::new(Some(text.into())),
            ..Self::default()
        }
    }

    /// Make subsequent reads fail until cleared
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent writes fail until cleared
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of read attempts
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Current content, bypassing failure injection
    pub async fn peek(&self) -> Option<String> {
        self.content.read().await.clone()
    }
}

#[async_trait]
impl ClipboardProvider for MemoryClipboard {
    async fn get_text(&self) -> Result<String, ClipboardError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ClipboardError::UnsupportedType("content is not text".to_string()));
        }
        self.content.read().await.clone().ok_or(ClipboardError::NoContent)
    }

    async fn set_text(&self, text: &str) -> Result<(), ClipboardError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ClipboardError::Platform("write rejected".to_string()));
        }
        *self.content.write().await = Some(text.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
