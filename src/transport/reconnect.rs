//! Connection lifecycle with automatic reconnection
//!
//! The lifecycle owns the target address and keeps one session alive
//! against it. Every session gets a fresh [`SyncLoop`]; when the session
//! ends the lifecycle connects again to the same target, immediately with
//! the default configuration or after an exponential backoff with jitter.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::clipboard::ClipboardProvider;
use crate::crypto::Cipher;
use crate::progress::OperatorFeedback;
use crate::sync::{SyncConfig, SyncLoop};
use crate::transport::{Result, Session, TransportConfig, TransportError};

/// Address of the peer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Opens byte streams to a target
#[async_trait]
pub trait Connector: Send + Sync {
    /// Stream type produced on success
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Connect to `target`
    async fn connect(&self, target: &Target) -> io::Result<Self::Stream>;
}

/// Plain TCP connector
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, target: &Target) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
        stream.set_nodelay(true)?;
        debug!(
            "TCP connection to {}: remote {}, local {}",
            target,
            stream.peer_addr()?,
            stream.local_addr()?
        );
        Ok(stream)
    }
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectionConfig {
    /// Maximum consecutive failed attempts before giving up (0 = infinite)
    pub max_attempts: u32,

    /// Delay before reconnecting; zero reconnects immediately
    pub initial_delay: Duration,

    /// Maximum delay between attempts
    pub max_delay: Duration,

    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,

    /// Jitter factor to randomize delays (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl ReconnectionConfig {
    /// Delay before the next attempt after `failures` consecutive failed attempts
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let base_delay = self.initial_delay.as_secs_f64();
        if base_delay <= 0.0 {
            return Duration::ZERO;
        }

        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let backoff_delay = base_delay * self.backoff_multiplier.powi(exponent);

        let clamped_delay = backoff_delay.min(self.max_delay.as_secs_f64());

        let jitter_range = clamped_delay * self.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;
        let final_delay = (clamped_delay + jitter).max(0.0);

        Duration::from_secs_f64(final_delay)
    }

    fn attempts_exhausted(&self, failures: u32) -> bool {
        self.max_attempts > 0 && failures >= self.max_attempts
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not started
    Idle,

    /// Connection attempt in progress
    Connecting,

    /// Session open and synchronizing
    Active,

    /// Waiting to connect again
    Reconnecting,

    /// Terminal
    Stopped,
}

/// Notifications published by the lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A connection attempt started; `attempt` counts since the last open session
    Connecting { attempt: u32 },

    /// A session completed its handshake
    SessionOpened { session_id: u64, target: Target },

    /// A session ended
    SessionClosed { session_id: u64, reason: String },

    /// A connection attempt failed
    ConnectFailed { attempt: u32, reason: String },

    /// The lifecycle stopped for good
    Stopped,
}

/// Keeps a synchronizing session alive against one target
pub struct ConnectionLifecycle<C: Connector> {
    connector: C,
    target: Target,
    transport: TransportConfig,
    reconnect: ReconnectionConfig,
    sync: SyncConfig,
    cipher: Arc<Cipher>,
    clipboard: Arc<dyn ClipboardProvider>,
    feedback: OperatorFeedback,
    state: LifecycleState,
    failures: u32,
    sessions_opened: u64,
    event_tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl<C: Connector> ConnectionLifecycle<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector: C,
        target: Target,
        transport: TransportConfig,
        reconnect: ReconnectionConfig,
        sync: SyncConfig,
        cipher: Arc<Cipher>,
        clipboard: Arc<dyn ClipboardProvider>,
        feedback: OperatorFeedback,
    ) -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let lifecycle = Self {
            connector,
            target,
            transport,
            reconnect,
            sync,
            cipher,
            clipboard,
            feedback,
            state: LifecycleState::Idle,
            failures: 0,
            sessions_opened: 0,
            event_tx,
        };

        (lifecycle, event_rx)
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Target this lifecycle connects to
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Sessions opened so far
    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened
    }

    /// Run until `shutdown` turns true or the attempt limit is reached.
    ///
    /// Returns an error only when reconnection gave up.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Starting connection lifecycle for {}", self.target);

        let outcome = loop {
            if *shutdown.borrow_and_update() {
                break Ok(());
            }

            self.set_state(LifecycleState::Connecting);
            let attempt = self.failures + 1;
            let session_id = self.sessions_opened + 1;
            self.emit(LifecycleEvent::Connecting { attempt });

            let opened = tokio::select! {
                result = self.open_session(session_id) => result,
                _ = wait_for_shutdown(&mut shutdown) => break Ok(()),
            };

            match opened {
                Ok(mut session) => {
                    self.failures = 0;
                    self.sessions_opened += 1;
                    self.set_state(LifecycleState::Active);
                    self.emit(LifecycleEvent::SessionOpened {
                        session_id,
                        target: self.target.clone(),
                    });
                    self.feedback.notice(&format!("Connected to {}", self.target));

                    let mut sync = SyncLoop::new(
                        Arc::clone(&self.clipboard),
                        self.sync.clone(),
                        self.feedback,
                    );

                    let finished = tokio::select! {
                        result = async {
                            sync.prime().await;
                            sync.run_session(&mut session).await
                        } => Some(result),
                        _ = wait_for_shutdown(&mut shutdown) => None,
                    };

                    let Some(result) = finished else {
                        if let Err(e) = session.close().await {
                            debug!("Error closing session {}: {}", session_id, e);
                        }
                        self.emit(LifecycleEvent::SessionClosed {
                            session_id,
                            reason: "shutdown".to_string(),
                        });
                        break Ok(());
                    };

                    let reason = match result {
                        Ok(()) => "peer closed the connection".to_string(),
                        Err(e) => e.to_string(),
                    };
                    warn!("Session {} to {} ended: {}", session_id, self.target, reason);
                    self.feedback
                        .warning(&format!("Disconnected from {}, reconnecting", self.target));
                    self.emit(LifecycleEvent::SessionClosed { session_id, reason });
                }
                Err(e) => {
                    self.failures += 1;
                    warn!("Connection attempt {} to {} failed: {}", attempt, self.target, e);
                    self.emit(LifecycleEvent::ConnectFailed {
                        attempt,
                        reason: e.to_string(),
                    });

                    if self.reconnect.attempts_exhausted(self.failures) {
                        error!(
                            "Max reconnection attempts ({}) reached for {}",
                            self.reconnect.max_attempts, self.target
                        );
                        break Err(TransportError::Reconnection {
                            message: format!(
                                "gave up on {} after {} attempts",
                                self.target, self.failures
                            ),
                        });
                    }
                }
            }

            self.set_state(LifecycleState::Reconnecting);
            let delay = self.reconnect.backoff_delay(self.failures);
            if !delay.is_zero() {
                debug!("Waiting {:?} before reconnecting", delay);
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = wait_for_shutdown(&mut shutdown) => break Ok(()),
                }
            }
        };

        self.set_state(LifecycleState::Stopped);
        self.emit(LifecycleEvent::Stopped);
        info!("Connection lifecycle for {} stopped", self.target);
        outcome
    }

    async fn open_session(&self, session_id: u64) -> Result<Session<C::Stream>> {
        debug!("Connecting to {}", self.target);

        let stream = match timeout(self.transport.connect_timeout, self.connector.connect(&self.target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::Connection {
                    target: self.target.to_string(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(TransportError::Timeout {
                    target: self.target.to_string(),
                    timeout: self.transport.connect_timeout,
                })
            }
        };

        Session::open(session_id, stream, &self.transport, Arc::clone(&self.cipher)).await
    }

    fn set_state(&mut self, state: LifecycleState) {
        if self.state != state {
            debug!("Lifecycle {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Resolves once the flag is true. Never resolves if the sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
