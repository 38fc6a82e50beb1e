//! Claude Code adapter.
//!
//! Targets the interactive `claude` TUI. `claude --resume` opens the session
//! picker with the most recent conversation highlighted; a fresh start is
//! initialised with `/init` before the payloads are sent.

use std::path::Path;
use std::time::Duration;

use crate::agent::{AgentAdapter, SpawnConfig};
use crate::config::AgentSettings;
use crate::prompt::PatternSet;

const BRACKETED_PASTE_START: &str = "\x1b[200~";
const BRACKETED_PASTE_END: &str = "\x1b[201~";

/// Adapter for the Claude Code CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCodeAdapter {
    program: String,
    resume_args: Vec<String>,
    fresh_args: Vec<String>,
    env: Vec<(String, String)>,
    init_command: String,
    resume_selection: String,
    acknowledgement: String,
    silence: Duration,
}

impl ClaudeCodeAdapter {
    pub fn from_settings(settings: &AgentSettings, silence: Duration) -> Self {
        Self {
            program: settings.program.clone(),
            resume_args: settings.resume_args.clone(),
            fresh_args: settings.fresh_args.clone(),
            env: settings
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            init_command: settings.init_command.clone(),
            resume_selection: settings.resume_selection.clone(),
            acknowledgement: settings.acknowledgement.clone(),
            silence,
        }
    }

    fn spawn(&self, args: &[String], work_dir: &Path) -> SpawnConfig {
        SpawnConfig {
            program: self.program.clone(),
            args: args.to_vec(),
            work_dir: work_dir.to_path_buf(),
            env: self.env.clone(),
        }
    }
}

impl Default for ClaudeCodeAdapter {
    fn default() -> Self {
        Self::from_settings(&AgentSettings::default(), Duration::from_secs(3))
    }
}

impl AgentAdapter for ClaudeCodeAdapter {
    fn name(&self) -> &str {
        "claude-code"
    }

    fn resume_spawn(&self, work_dir: &Path) -> SpawnConfig {
        self.spawn(&self.resume_args, work_dir)
    }

    fn fresh_spawn(&self, work_dir: &Path) -> SpawnConfig {
        self.spawn(&self.fresh_args, work_dir)
    }

    fn probe_patterns(&self) -> PatternSet {
        PatternSet::claude_code_probe()
    }

    fn ready_patterns(&self) -> PatternSet {
        PatternSet::claude_code_ready(self.silence)
    }

    fn ack_patterns(&self) -> PatternSet {
        PatternSet::claude_code_ack(self.silence)
    }

    fn init_command(&self) -> &str {
        &self.init_command
    }

    fn resume_selection(&self) -> &str {
        &self.resume_selection
    }

    fn acknowledgement(&self) -> &str {
        &self.acknowledgement
    }

    fn format_input(&self, text: &str) -> String {
        let text = text.trim_end_matches(['\r', '\n']);
        if text.contains('\n') {
            // A bare newline would submit the first line on its own.
            format!("{BRACKETED_PASTE_START}{text}{BRACKETED_PASTE_END}\r")
        } else {
            format!("{text}\r")
        }
    }
}
