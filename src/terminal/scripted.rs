//! Scripted in-memory terminal.
//!
//! Plays the part of the Claude Code TUI for tests and scenario runs: a
//! session picker or a "no conversations" notice on `--resume`, trust prompts
//! on a fresh start, and a busy/ready cycle for every submitted input. Each
//! unit (keyed by the working directory name) follows its own [`Scenario`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Channel, ChannelError, CloseMode, TerminalError, TerminalStrategy};
use crate::agent::SpawnConfig;

pub const SESSION_LIST: &str = "Resume Session\n❯ 1. earlier work on this project  (2 hours ago)\n  2. older work  (3 days ago)\n";
pub const NO_SESSIONS: &str = "No conversations found to resume.\n";
pub const TRUST_PROMPT: &str = "Do you trust the files in this folder?\n❯ 1. Yes, proceed\n  2. No, exit\n";
pub const READY: &str = "╭──────────────╮\n│ >            │\n╰──────────────╯\n  ? for shortcuts\n";
pub const BUSY: &str = "✻ Working… (esc to interrupt)\n";
pub const AGENT_ERROR: &str = "API Error: 500 internal server error\n";

/// Behaviour of the fake agent for one unit.
#[derive(Debug, Clone, Default)]
pub struct Scenario {
    /// `--resume` lists a prior session.
    pub has_session: bool,
    /// `--resume` prints nothing at all (probe timeout).
    pub probe_silent: bool,
    pub fail_resume_open: bool,
    pub fail_fresh_open: bool,
    /// Trust prompts shown before the input prompt on a fresh start.
    pub confirmations: usize,
    /// The process exits after this many submitted inputs.
    pub close_after_sends: Option<usize>,
    /// The agent prints an error after this many submitted inputs.
    pub error_after_sends: Option<usize>,
    /// Time spent "working" on each submitted input.
    pub work_time: Duration,
}

impl Scenario {
    pub fn resumable() -> Self {
        Self {
            has_session: true,
            ..Self::default()
        }
    }

    pub fn silent_probe() -> Self {
        Self {
            probe_silent: true,
            ..Self::default()
        }
    }
}

/// What the fake agent saw, per unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitRecord {
    /// `"resume"` or `"fresh"`, in open order.
    pub opens: Vec<&'static str>,
    /// Every text sent, in order.
    pub sent: Vec<String>,
    /// Close modes, in order.
    pub closes: Vec<CloseMode>,
}

#[derive(Debug, Default)]
pub struct ScriptedTerminal {
    scenarios: HashMap<String, Scenario>,
    fallback: Scenario,
    records: Arc<Mutex<HashMap<String, UnitRecord>>>,
}

impl ScriptedTerminal {
    pub fn new(fallback: Scenario) -> Self {
        Self {
            fallback,
            ..Self::default()
        }
    }

    pub fn with_unit(mut self, label: &str, scenario: Scenario) -> Self {
        self.scenarios.insert(label.to_string(), scenario);
        self
    }

    pub fn record(&self, label: &str) -> UnitRecord {
        self.records
            .lock()
            .map(|r| r.get(label).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn note(&self, label: &str, f: impl FnOnce(&mut UnitRecord)) {
        note(&self.records, label, f);
    }
}

fn note(records: &Mutex<HashMap<String, UnitRecord>>, label: &str, f: impl FnOnce(&mut UnitRecord)) {
    if let Ok(mut records) = records.lock() {
        f(records.entry(label.to_string()).or_default());
    }
}

impl TerminalStrategy for ScriptedTerminal {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn open(&self, spawn: &SpawnConfig) -> Result<Box<dyn Channel>, TerminalError> {
        let label = spawn
            .work_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let scenario = self
            .scenarios
            .get(&label)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone());
        let resume = spawn.args.iter().any(|a| a == "--resume");

        if (resume && scenario.fail_resume_open) || (!resume && scenario.fail_fresh_open) {
            return Err(TerminalError::new("scripted", spawn, "scripted open failure"));
        }
        self.note(&label, |r| r.opens.push(if resume { "resume" } else { "fresh" }));

        let mut channel = ScriptedChannel {
            label,
            output: VecDeque::new(),
            stage: Stage::Prompt,
            submitted: 0,
            exit_when_drained: false,
            closed: false,
            scenario: scenario.clone(),
            records: Arc::clone(&self.records),
        };

        if resume {
            if scenario.probe_silent {
                channel.stage = Stage::Silent;
            } else if scenario.has_session {
                channel.stage = Stage::Picker;
                channel.emit(SESSION_LIST);
            } else {
                channel.emit(NO_SESSIONS);
                channel.exit_when_drained = true;
            }
        } else if scenario.confirmations > 0 {
            channel.stage = Stage::Confirm(scenario.confirmations);
            channel.emit(TRUST_PROMPT);
        } else {
            channel.emit(READY);
        }
        Ok(Box::new(channel))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Silent,
    Picker,
    Confirm(usize),
    Prompt,
}

struct ScriptedChannel {
    label: String,
    output: VecDeque<String>,
    stage: Stage,
    submitted: usize,
    exit_when_drained: bool,
    closed: bool,
    scenario: Scenario,
    records: Arc<Mutex<HashMap<String, UnitRecord>>>,
}

impl ScriptedChannel {
    fn emit(&mut self, text: &str) {
        self.output.push_back(text.to_string());
    }
}

impl Channel for ScriptedChannel {
    fn send(&mut self, text: &str) -> Result<(), ChannelError> {
        if self.closed || (self.exit_when_drained && self.output.is_empty()) {
            return Err(ChannelError::Closed);
        }
        note(&self.records, &self.label, |r| r.sent.push(text.to_string()));

        match self.stage {
            Stage::Silent => {}
            Stage::Picker => {
                self.stage = Stage::Prompt;
                self.emit(READY);
            }
            Stage::Confirm(remaining) if remaining > 1 => {
                self.stage = Stage::Confirm(remaining - 1);
                self.emit(TRUST_PROMPT);
            }
            Stage::Confirm(_) => {
                self.stage = Stage::Prompt;
                self.emit(READY);
            }
            Stage::Prompt => {
                self.submitted += 1;
                if !self.scenario.work_time.is_zero() {
                    std::thread::sleep(self.scenario.work_time);
                }
                if self.scenario.close_after_sends == Some(self.submitted) {
                    self.output.clear();
                    self.exit_when_drained = true;
                } else if self.scenario.error_after_sends == Some(self.submitted) {
                    self.emit(&format!("{BUSY}{AGENT_ERROR}"));
                } else {
                    self.emit(&format!("{BUSY}{READY}"));
                }
            }
        }
        Ok(())
    }

    fn read_available(&mut self, timeout: Duration) -> Result<String, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        if let Some(chunk) = self.output.pop_front() {
            return Ok(chunk);
        }
        if self.exit_when_drained {
            return Err(ChannelError::Closed);
        }
        std::thread::sleep(timeout);
        Ok(String::new())
    }

    fn close(&mut self, mode: CloseMode) {
        if self.closed {
            return;
        }
        self.closed = true;
        note(&self.records, &self.label, |r| r.closes.push(mode));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spawn(label: &str, resume: bool) -> SpawnConfig {
        let args = if resume {
            vec!["--resume".to_string()]
        } else {
            vec![]
        };
        SpawnConfig {
            program: "claude".to_string(),
            args,
            work_dir: PathBuf::from("/work").join(label),
            env: vec![],
        }
    }

    #[test]
    fn resume_with_session_shows_picker_then_prompt() {
        let terminal = ScriptedTerminal::new(Scenario::resumable());
        let mut ch = terminal.open(&spawn("alpha", true)).unwrap();
        let first = ch.read_available(Duration::from_millis(1)).unwrap();
        assert!(first.contains("Resume Session"));
        ch.send("\r").unwrap();
        assert_eq!(ch.read_available(Duration::from_millis(1)).unwrap(), READY);
        assert_eq!(terminal.record("alpha").opens, vec!["resume"]);
    }

    #[test]
    fn resume_without_session_exits() {
        let terminal = ScriptedTerminal::new(Scenario::default());
        let mut ch = terminal.open(&spawn("beta", true)).unwrap();
        assert_eq!(ch.read_available(Duration::from_millis(1)).unwrap(), NO_SESSIONS);
        assert_eq!(
            ch.read_available(Duration::from_millis(1)),
            Err(ChannelError::Closed)
        );
    }

    #[test]
    fn fresh_start_asks_for_trust_first() {
        let terminal = ScriptedTerminal::new(Scenario {
            confirmations: 2,
            ..Scenario::default()
        });
        let mut ch = terminal.open(&spawn("gamma", false)).unwrap();
        assert_eq!(ch.read_available(Duration::from_millis(1)).unwrap(), TRUST_PROMPT);
        ch.send("\r").unwrap();
        assert_eq!(ch.read_available(Duration::from_millis(1)).unwrap(), TRUST_PROMPT);
        ch.send("\r").unwrap();
        assert_eq!(ch.read_available(Duration::from_millis(1)).unwrap(), READY);
    }

    #[test]
    fn close_after_sends_ends_stream() {
        let terminal = ScriptedTerminal::new(Scenario {
            close_after_sends: Some(1),
            ..Scenario::default()
        });
        let mut ch = terminal.open(&spawn("delta", false)).unwrap();
        ch.read_available(Duration::from_millis(1)).unwrap();
        ch.send("/init\r").unwrap();
        assert_eq!(
            ch.read_available(Duration::from_millis(1)),
            Err(ChannelError::Closed)
        );
    }

    #[test]
    fn open_failures_follow_scenario() {
        let terminal = ScriptedTerminal::new(Scenario::default()).with_unit(
            "broken",
            Scenario {
                fail_resume_open: true,
                ..Scenario::default()
            },
        );
        assert!(terminal.open(&spawn("broken", true)).is_err());
        assert!(terminal.open(&spawn("broken", false)).is_ok());
        assert!(terminal.open(&spawn("fine", true)).is_ok());
    }

    #[test]
    fn closes_are_recorded() {
        let terminal = ScriptedTerminal::new(Scenario::default());
        let mut ch = terminal.open(&spawn("eps", false)).unwrap();
        ch.close(CloseMode::Detach);
        ch.close(CloseMode::Terminate);
        assert_eq!(terminal.record("eps").closes, vec![CloseMode::Detach]);
    }
}
