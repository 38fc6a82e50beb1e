//! Agent adapter layer.
//!
//! The interactive program driven in each unit is wrapped in an adapter that
//! knows how to:
//! - Build the commands that open its session picker and start it fresh
//! - Provide the prompt patterns for probing, readiness and acknowledgement
//! - Format payload text for its input line
//!
//! The session state machine drives agents through this trait without
//! knowing their CLI conventions.

pub mod claude;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::AgentSettings;
use crate::prompt::PatternSet;

/// Configuration for spawning an agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnConfig {
    /// The program to execute (e.g., "claude").
    pub program: String,
    pub args: Vec<String>,
    /// Working directory for the agent process. Always the unit directory.
    pub work_dir: PathBuf,
    /// Environment variables to set (key, value pairs).
    pub env: Vec<(String, String)>,
}

impl SpawnConfig {
    /// The command line as a user would type it.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Trait that all agent adapters must implement.
///
/// An adapter does not own the terminal or the process; it only provides the
/// configuration and patterns needed to drive the agent.
pub trait AgentAdapter: Send + Sync {
    /// Human-readable name of the agent (e.g., "claude-code").
    fn name(&self) -> &str;

    /// Command that opens the agent's session listing in `work_dir`.
    fn resume_spawn(&self, work_dir: &Path) -> SpawnConfig;

    /// Command that starts a new session in `work_dir`.
    fn fresh_spawn(&self, work_dir: &Path) -> SpawnConfig;

    fn probe_patterns(&self) -> PatternSet;

    /// Gate that must pass before any input is sent.
    fn ready_patterns(&self) -> PatternSet;

    /// Signals that the last input was taken.
    fn ack_patterns(&self) -> PatternSet;

    /// Command sent first on a fresh session.
    fn init_command(&self) -> &str;

    /// Keystrokes that pick the top entry of the session listing.
    fn resume_selection(&self) -> &str;

    /// Keystrokes that answer a confirmation or permission prompt.
    fn acknowledgement(&self) -> &str;

    /// Format payload text so it is submitted as one input.
    fn format_input(&self, text: &str) -> String;
}

/// Look up an agent adapter by name.
///
/// Returns `None` if the agent name is not recognized.
pub fn adapter_from_name(
    name: &str,
    settings: &AgentSettings,
    silence: Duration,
) -> Option<Box<dyn AgentAdapter>> {
    match name {
        "claude" | "claude-code" => Some(Box::new(claude::ClaudeCodeAdapter::from_settings(
            settings, silence,
        ))),
        _ => None,
    }
}
