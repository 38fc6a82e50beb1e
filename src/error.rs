//! Error taxonomy for the session automation engine.
//!
//! Run-scoped errors ([`ScanError`], [`ConfigError`]) stop a run before any
//! unit is dispatched. Unit-scoped errors ([`UnitError`]) never leave the unit
//! boundary: they are recorded in that unit's `LaunchResult`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::payload::{PayloadSlot, StepKind};

/// The base directory could not be enumerated.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("base path {} does not exist", .0.display())]
    Missing(PathBuf),

    #[error("base path {} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Invalid run settings, detected before any dispatch.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_parallel must be at least 1 (got {0})")]
    InvalidParallelism(usize),

    #[error("{name} must be greater than zero")]
    ZeroTimeout { name: &'static str },

    #[error(
        "silence fallback ({}ms) must be at least the poll interval ({}ms)",
        .silence.as_millis(),
        .poll.as_millis()
    )]
    SilenceBelowPoll { silence: Duration, poll: Duration },

    #[error("invalid exclude pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("invalid stage pattern '{pattern}': {source}")]
    InvalidStage {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("unknown terminal strategy '{0}' (expected auto, tmux or pty)")]
    UnknownTerminal(String),

    #[error("agent program must not be empty")]
    EmptyProgram,

    #[error("unknown agent '{0}' (expected claude)")]
    UnknownAgent(String),
}

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure of a single work unit. Stored in its `LaunchResult`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UnitError {
    /// The session listing did not answer in time. Recovered as a fresh start;
    /// only surfaces in logs.
    #[error("session probe timed out")]
    ProbeTimeout { captured: String },

    #[error("timed out waiting for the agent to become ready before {step}")]
    InjectionTimeout { step: StepKind, captured: String },

    #[error("channel failed: {detail}")]
    Channel { detail: String },

    #[error("required {slot} payload not found (searched: {})", display_paths(.searched))]
    PayloadMissing {
        slot: PayloadSlot,
        searched: Vec<PathBuf>,
    },

    #[error("failed to read {} payload {}: {detail}", .slot, .path.display())]
    PayloadUnreadable {
        slot: PayloadSlot,
        path: PathBuf,
        detail: String,
    },

    #[error("terminal could not be opened: {detail}")]
    Terminal { detail: String },

    #[error("agent reported an error: {detail}")]
    Agent { detail: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("unit panicked: {detail}")]
    Panicked { detail: String },

    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "(nothing)".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
