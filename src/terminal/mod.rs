//! Terminal strategies.
//!
//! A [`TerminalStrategy`] opens a terminal bound to a working directory and
//! hands back a [`Channel`] to the process running inside it. Strategies are
//! chosen once per run and shared by every unit.

pub mod pty;
#[cfg(any(test, feature = "scenario-test"))]
pub mod scripted;
pub mod tmux;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::agent::SpawnConfig;
use crate::error::ConfigError;

/// Failure on an open channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The process exited or the output stream ended.
    #[error("channel closed")]
    Closed,

    #[error("channel I/O failed: {0}")]
    Io(String),
}

/// A terminal could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{strategy} terminal failed to open in {}: {detail}", .work_dir.display())]
pub struct TerminalError {
    pub strategy: &'static str,
    pub work_dir: PathBuf,
    pub detail: String,
}

impl TerminalError {
    pub fn new(strategy: &'static str, spawn: &SpawnConfig, detail: impl fmt::Display) -> Self {
        Self {
            strategy,
            work_dir: spawn.work_dir.clone(),
            detail: detail.to_string(),
        }
    }
}

/// What happens to the process when its channel is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Stop reading; leave the process running where the strategy allows it.
    Detach,
    /// Stop the process.
    Terminate,
}

/// Bidirectional text channel to a process in a terminal.
pub trait Channel: Send {
    /// Write raw text (including any submit keystroke) to the process.
    fn send(&mut self, text: &str) -> Result<(), ChannelError>;

    /// Text that arrived within `timeout`. An empty string means nothing
    /// arrived; `Err(Closed)` means nothing more ever will.
    fn read_available(&mut self, timeout: Duration) -> Result<String, ChannelError>;

    /// Release the channel. Calling it twice is harmless.
    fn close(&mut self, mode: CloseMode);
}

/// Opens terminals. Implementations are shared across unit threads.
pub trait TerminalStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a terminal running `spawn.program` in `spawn.work_dir`.
    fn open(&self, spawn: &SpawnConfig) -> Result<Box<dyn Channel>, TerminalError>;

    /// Shell command that shows the unit's terminal to a user, if the
    /// strategy leaves one behind.
    fn attach_hint(&self, _label: &str) -> Option<String> {
        None
    }
}

/// Resolve a strategy selector (`auto`, `tmux`, `pty`).
pub fn strategy_from_name(name: &str) -> Result<Arc<dyn TerminalStrategy>, ConfigError> {
    let strategy: Arc<dyn TerminalStrategy> = match name {
        "tmux" => Arc::new(tmux::TmuxStrategy::detect()),
        "pty" => Arc::new(pty::PtyStrategy::default()),
        "auto" => match crate::tmux::check_tmux() {
            Ok(version) => {
                debug!(%version, "tmux available");
                Arc::new(tmux::TmuxStrategy::with_version(&version))
            }
            Err(e) => {
                debug!(error = %e, "tmux unavailable, using pty");
                Arc::new(pty::PtyStrategy::default())
            }
        },
        other => return Err(ConfigError::UnknownTerminal(other.to_string())),
    };
    info!(strategy = strategy.name(), "terminal strategy selected");
    Ok(strategy)
}

/// Decode as much of `pending` as forms complete UTF-8, leaving a trailing
/// partial sequence in place for the next read.
pub(crate) fn decode_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let tail = pending.split_off(valid);
            let text = String::from_utf8_lossy(pending).to_string();
            *pending = tail;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).to_string();
            pending.clear();
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_strategy_is_config_error() {
        let err = strategy_from_name("xterm").err().unwrap();
        assert!(matches!(err, ConfigError::UnknownTerminal(name) if name == "xterm"));
    }

    #[test]
    fn pty_strategy_by_name() {
        let strategy = strategy_from_name("pty").unwrap();
        assert_eq!(strategy.name(), "pty");
        assert!(strategy.attach_hint("alpha").is_none());
    }

    #[test]
    fn decode_keeps_partial_sequence() {
        // "é" is 0xC3 0xA9.
        let mut pending = vec![b'a', 0xC3];
        assert_eq!(decode_utf8(&mut pending), "a");
        assert_eq!(pending, vec![0xC3]);

        pending.push(0xA9);
        assert_eq!(decode_utf8(&mut pending), "é");
        assert!(pending.is_empty());
    }

    #[test]
    fn decode_replaces_invalid_bytes() {
        let mut pending = vec![b'x', 0xFF, b'y'];
        assert_eq!(decode_utf8(&mut pending), "x\u{FFFD}y");
        assert!(pending.is_empty());
    }

    #[test]
    fn terminal_error_names_directory() {
        let spawn = SpawnConfig {
            program: "claude".to_string(),
            args: vec![],
            work_dir: PathBuf::from("/work/alpha"),
            env: vec![],
        };
        let err = TerminalError::new("pty", &spawn, "no such file");
        assert_eq!(
            err.to_string(),
            "pty terminal failed to open in /work/alpha: no such file"
        );
    }
}
