use std::path::PathBuf;
use std::sync::Arc;

use clap::builder::NonEmptyStringValueParser;
use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clipboard::{ClipboardProvider, MemoryClipboard, SystemClipboard};
use crate::config::Config;
use crate::crypto::Cipher;
use crate::passphrase;
use crate::progress::OperatorFeedback;
use crate::transport::{ConnectionLifecycle, Target, TcpConnector};
use crate::{Error, Result};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("TARGET"),
    ", built ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "netpaste")]
#[command(about = "Two-way clipboard synchronization with a netpaste peer")]
#[command(version, long_version = LONG_VERSION)]
pub struct Cli {
    /// Host name or address of the peer
    #[arg(value_parser = NonEmptyStringValueParser::new())]
    pub hostname: String,

    /// Port of the peer [default: 8484, or default_port from the config file]
    pub port: Option<u16>,

    /// Do not watch the local clipboard; only apply updates from the peer
    #[arg(long)]
    pub no_clipboard: bool,

    /// Path to a configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Peer address, falling back to `default_port` when no port was given
    pub fn target(&self, default_port: u16) -> Target {
        Target::new(self.hostname.clone(), self.port.unwrap_or(default_port))
    }
}

pub struct CliHandler {
    cli: Cli,
    config: Config,
}

impl CliHandler {
    pub fn new(cli: Cli, config: Config) -> Self {
        Self { cli, config }
    }

    /// Acquire the passphrase, then synchronize until Ctrl-C
    pub async fn run(self) -> Result<()> {
        let target = self.cli.target(self.config.default_port);
        let feedback = OperatorFeedback::new();

        let passphrase = tokio::task::spawn_blocking(passphrase::acquire)
            .await
            .map_err(|e| Error::Other(format!("passphrase prompt failed: {}", e)))??;

        let params = self.config.kdf_params();
        let cipher = tokio::task::spawn_blocking(move || Cipher::new(&passphrase, params))
            .await
            .map_err(|e| Error::Other(format!("key derivation failed: {}", e)))??;
        debug!(kdf = ?cipher.params(), "Derived encryption key");

        let clipboard = open_clipboard();
        info!("Using {} clipboard", clipboard.name());

        let (mut lifecycle, mut events) = ConnectionLifecycle::new(
            TcpConnector,
            target.clone(),
            self.config.transport_config(),
            self.config.reconnection_config(),
            self.config.sync_config(!self.cli.no_clipboard),
            Arc::new(cipher),
            clipboard,
            feedback,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                let _ = shutdown_tx.send(true);
            }
        });

        let event_log = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!(?event, "Lifecycle event");
            }
        });

        feedback.notice(&format!("Connecting to {}", target));
        let result = lifecycle.run(shutdown_rx).await;

        drop(lifecycle);
        let _ = event_log.await;

        result?;
        feedback.notice("Stopped");
        Ok(())
    }
}

fn open_clipboard() -> Arc<dyn ClipboardProvider> {
    match SystemClipboard::new() {
        Ok(clipboard) => Arc::new(clipboard),
        Err(e) => {
            warn!("System clipboard unavailable ({}), using an in-memory clipboard", e);
            Arc::new(MemoryClipboard::new())
        }
    }
}
