//! Clipboard synchronization loop
//!
//! A [`SyncLoop`] is bound to exactly one session. It polls the local
//! clipboard on a fixed period and sends changes to the peer, and it writes
//! updates received from the peer into the clipboard. The clipboard baseline
//! and the echo-suppression flag are plain fields, because only the task
//! driving the loop ever touches them.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clipboard::ClipboardProvider;
use crate::progress::OperatorFeedback;
use crate::transport::{Payload, Result, Session, SessionReader, SessionSender, TransportError};

/// Default clipboard polling period
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Sync loop settings
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Clipboard polling period
    pub poll_interval: Duration,

    /// Watch the local clipboard; when false, inbound updates are still applied
    pub monitor: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            monitor: true,
        }
    }
}

/// Result of one clipboard poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Content empty or equal to the baseline
    Unchanged,

    /// Content adopted as baseline while a remote update was being applied
    Absorbed,

    /// Content sent to the peer
    Sent { characters: usize },

    /// Clipboard could not be read
    ReadFailed,
}

#[derive(Debug, PartialEq, Eq)]
enum Observation {
    Unreadable,
    Absorbed,
    Unchanged,
    Changed(String),
}

/// Per-session clipboard synchronization
pub struct SyncLoop {
    clipboard: Arc<dyn ClipboardProvider>,
    config: SyncConfig,
    feedback: OperatorFeedback,
    baseline: Option<String>,
    applying_remote: bool,
    read_failed: bool,
    updates_sent: u64,
    updates_applied: u64,
}

impl SyncLoop {
    pub fn new(clipboard: Arc<dyn ClipboardProvider>, config: SyncConfig, feedback: OperatorFeedback) -> Self {
        Self {
            clipboard,
            config,
            feedback,
            baseline: None,
            applying_remote: false,
            read_failed: false,
            updates_sent: 0,
            updates_applied: 0,
        }
    }

    /// Take the current clipboard content as the baseline, so a new session
    /// does not send what is already there.
    pub async fn prime(&mut self) {
        if let Some(content) = self.read_clipboard().await {
            debug!("Clipboard baseline primed ({} characters)", content.chars().count());
            self.baseline = Some(content);
        }
    }

    /// Last observed clipboard content
    pub fn baseline(&self) -> Option<&str> {
        self.baseline.as_deref()
    }

    /// Whether a remote update is being applied right now
    pub fn is_applying_remote(&self) -> bool {
        self.applying_remote
    }

    /// Whether the clipboard is in a read failure episode
    pub fn is_read_failing(&self) -> bool {
        self.read_failed
    }

    /// Updates handed to the session for the peer
    pub fn updates_sent(&self) -> u64 {
        self.updates_sent
    }

    /// Remote updates written to the clipboard
    pub fn updates_applied(&self) -> u64 {
        self.updates_applied
    }

    /// Observe the clipboard once and queue it for the peer if it changed.
    ///
    /// Only fails when the session can no longer take messages.
    pub async fn poll_once(&mut self, sender: &SessionSender) -> Result<PollOutcome> {
        let content = match self.observe().await {
            Observation::Unreadable => return Ok(PollOutcome::ReadFailed),
            Observation::Absorbed => return Ok(PollOutcome::Absorbed),
            Observation::Unchanged => return Ok(PollOutcome::Unchanged),
            Observation::Changed(content) => content,
        };

        let characters = content.chars().count();
        self.feedback.sending(characters);

        let update = Payload::Update(content);
        if let Err(e) = sender.send_payload(&update) {
            self.feedback.send_result(false);
            warn!("Failed to send clipboard update: {}", e);
            return Err(e);
        }

        self.updates_sent += 1;
        if let Payload::Update(content) = update {
            self.baseline = Some(content);
        }
        Ok(PollOutcome::Sent { characters })
    }

    /// Report the outcome of a queued update.
    ///
    /// A write failure is returned as an error and ends the session.
    pub fn handle_delivery(&mut self, delivery: Option<Result<usize>>) -> Result<()> {
        match delivery {
            Some(Ok(bytes)) => {
                self.feedback.send_result(true);
                debug!("Clipboard update delivered ({} encrypted bytes)", bytes);
                Ok(())
            }
            Some(Err(e)) => {
                self.feedback.send_result(false);
                warn!("Failed to send clipboard update: {}", e);
                Err(e)
            }
            None => Err(TransportError::ConnectionClosed),
        }
    }

    /// Route one inbound payload
    pub async fn handle_payload(&mut self, payload: Payload) {
        match payload {
            Payload::Hello(banner) => info!("Peer handshake: {}", banner),
            Payload::Update(content) => self.apply_inbound(&content).await,
        }
    }

    /// Write a remote update into the clipboard without echoing it back
    pub async fn apply_inbound(&mut self, content: &str) {
        self.applying_remote = true;

        match self.clipboard.set_text(content).await {
            Ok(()) => {
                self.updates_applied += 1;
                debug!("Applied remote update ({} characters)", content.chars().count());

                // The clipboard may normalize what was written; the observed
                // value is what later polls compare against.
                if self.observe().await == Observation::Unreadable {
                    self.baseline = Some(content.to_string());
                }
            }
            Err(e) => warn!("Failed to apply remote clipboard update: {}", e),
        }

        self.applying_remote = false;
    }

    /// Drive the session until the peer ends it or an error occurs.
    ///
    /// Reads, polls and delivery reports are multiplexed here while the
    /// sender's task does the writing, so a large outbound update never
    /// stops inbound data from being drained. `Ok(())` means the peer closed
    /// the stream.
    pub async fn run<R>(&mut self, reader: &mut SessionReader<R>, sender: &mut SessionSender) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let period = self.config.poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if !self.config.monitor {
            info!("Clipboard monitoring disabled, receiving updates only");
        }

        loop {
            tokio::select! {
                received = reader.recv_payloads() => {
                    match received? {
                        Some(payloads) => {
                            for payload in payloads {
                                self.handle_payload(payload).await;
                            }
                        }
                        None => return Ok(()),
                    }
                }
                delivery = sender.next_delivery() => {
                    self.handle_delivery(delivery)?;
                }
                _ = ticker.tick(), if self.config.monitor => {
                    self.poll_once(sender).await?;
                }
            }
        }
    }

    /// Run against a whole session, closing it when the loop ends
    pub async fn run_session<S>(&mut self, session: &mut Session<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let outcome = match session.halves() {
            Ok((reader, sender)) => self.run(reader, sender).await,
            Err(e) => Err(e),
        };
        if let Err(e) = session.close().await {
            debug!("Session {} did not close cleanly: {}", session.id(), e);
        }
        outcome
    }

    /// Read the clipboard and classify it against the baseline.
    ///
    /// While a remote update is being applied, whatever is read becomes the
    /// baseline, so the write just performed is never seen as a local change.
    async fn observe(&mut self) -> Observation {
        let Some(content) = self.read_clipboard().await else {
            return Observation::Unreadable;
        };

        if self.applying_remote {
            self.baseline = Some(content);
            return Observation::Absorbed;
        }

        if content.is_empty() || self.baseline.as_deref() == Some(content.as_str()) {
            Observation::Unchanged
        } else {
            Observation::Changed(content)
        }
    }

    async fn read_clipboard(&mut self) -> Option<String> {
        match self.clipboard.get_text().await {
            Ok(content) => {
                if self.read_failed {
                    info!("Clipboard readable again");
                    self.read_failed = false;
                }
                Some(content)
            }
            Err(e) => {
                if !self.read_failed {
                    warn!("Failed to read clipboard: {}", e);
                    self.read_failed = true;
                }
                None
            }
        }
    }
}
