//! Operator feedback for clipboard sends and connection changes
//!
//! These lines are meant for a human watching the terminal. They are not
//! a machine interface and are separate from `tracing` logs.

use std::io::{self, Write};

use chrono::Local;
use crossterm::style::Stylize;

/// Prints progress lines to stdout, or nothing when quiet
#[derive(Debug, Clone, Copy)]
pub struct OperatorFeedback {
    enabled: bool,
}

impl Default for OperatorFeedback {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorFeedback {
    /// Feedback printed to stdout
    pub fn new() -> Self {
        Self { enabled: true }
    }

    /// Feedback that prints nothing
    pub fn quiet() -> Self {
        Self { enabled: false }
    }

    /// Whether anything is printed
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Start a send line; completed by [`OperatorFeedback::send_result`]
    pub fn sending(&self, characters: usize) {
        if !self.enabled {
            return;
        }
        print!(
            "{} {}{} characters...",
            format!("[{}]", timestamp()).dark_grey(),
            "Sending content: ".blue(),
            characters.to_string().yellow()
        );
        io::stdout().flush().unwrap_or(());
    }

    /// Finish the current send line
    pub fn send_result(&self, ok: bool) {
        if !self.enabled {
            return;
        }
        if ok {
            println!("{}", " Ok.".green());
        } else {
            println!("{}", " Error.".red());
        }
    }

    /// Print a connection notice
    pub fn notice(&self, message: &str) {
        if !self.enabled {
            return;
        }
        println!("{} {}", format!("[{}]", timestamp()).dark_grey(), message);
    }

    /// Print a failure notice
    pub fn warning(&self, message: &str) {
        if !self.enabled {
            return;
        }
        println!(
            "{} {}",
            format!("[{}]", timestamp()).dark_grey(),
            message.red()
        );
    }
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}
