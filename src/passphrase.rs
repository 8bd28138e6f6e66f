//! Passphrase acquisition
//!
//! The passphrase is read once at startup, before any connection is made.
//! It comes from the `NETPASTE_PASSPHRASE` environment variable when set,
//! otherwise from a prompt on the terminal with echo disabled, otherwise
//! from the first line of standard input.

use std::io::{self, BufRead, IsTerminal, Write};

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

/// Environment variable holding the passphrase
pub const PASSPHRASE_ENV: &str = "NETPASTE_PASSPHRASE";

/// Passphrase errors
#[derive(Debug, Error)]
pub enum PassphraseError {
    /// Nothing was entered
    #[error("Passphrase must not be empty")]
    Empty,

    /// Prompt was aborted by the user
    #[error("Passphrase entry cancelled")]
    Cancelled,

    /// Terminal or stdin failure
    #[error("Failed to read passphrase: {0}")]
    Io(#[from] io::Error),
}

/// Obtain the passphrase from the environment, the terminal or stdin
pub fn acquire() -> Result<Zeroizing<String>, PassphraseError> {
    if let Ok(value) = std::env::var(PASSPHRASE_ENV) {
        debug!("Using passphrase from {}", PASSPHRASE_ENV);
        return non_empty(Zeroizing::new(value));
    }

    if io::stdin().is_terminal() {
        prompt("Passphrase: ")
    } else {
        debug!("Reading passphrase from standard input");
        read_line(io::stdin().lock())
    }
}

/// Read the passphrase from the first line of `reader`
pub fn read_line<R: BufRead>(mut reader: R) -> Result<Zeroizing<String>, PassphraseError> {
    let mut line = Zeroizing::new(String::new());
    reader.read_line(&mut line)?;
    non_empty(Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Prompt on the terminal without echoing input
pub fn prompt(label: &str) -> Result<Zeroizing<String>, PassphraseError> {
    let mut stderr = io::stderr();
    write!(stderr, "{}", label)?;
    stderr.flush()?;

    enable_raw_mode()?;
    let entered = read_hidden();
    disable_raw_mode()?;
    writeln!(stderr)?;

    non_empty(entered?)
}

fn read_hidden() -> Result<Zeroizing<String>, PassphraseError> {
    let mut input = Zeroizing::new(String::with_capacity(128));

    loop {
        if let Event::Key(key) = event::read()? {
            if key.kind == KeyEventKind::Release {
                continue;
            }
            match key.code {
                KeyCode::Enter => return Ok(input),
                KeyCode::Esc => return Err(PassphraseError::Cancelled),
                KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                    return Err(PassphraseError::Cancelled)
                }
                KeyCode::Backspace => {
                    input.pop();
                }
                KeyCode::Char(c) => input.push(c),
                _ => {}
            }
        }
    }
}

fn non_empty(passphrase: Zeroizing<String>) -> Result<Zeroizing<String>, PassphraseError> {
    if passphrase.is_empty() {
        Err(PassphraseError::Empty)
    } else {
        Ok(passphrase)
    }
}
