//! tmux terminal strategy.
//!
//! Each unit runs in a detached session `coderun-<label>`. Output is captured
//! with pipe-pane into `<unit>/.coderun/pane.log` and read back by offset;
//! input goes through `send-keys -l`. Detaching stops the capture and leaves
//! the session running for the user to attach to.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{Channel, ChannelError, CloseMode, TerminalError, TerminalStrategy, decode_utf8};
use crate::agent::SpawnConfig;
use crate::paths;
use crate::tmux;

const FILE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
pub struct TmuxStrategy {
    session_env: bool,
}

impl TmuxStrategy {
    /// Probe the installed tmux for optional features.
    pub fn detect() -> Self {
        match tmux::check_tmux() {
            Ok(version) => Self::with_version(&version),
            Err(e) => {
                warn!(error = %e, "tmux check failed; sessions will fail to open");
                Self { session_env: true }
            }
        }
    }

    pub fn with_version(version_raw: &str) -> Self {
        Self {
            session_env: tmux::supports_session_env(version_raw),
        }
    }
}

fn label_for(work_dir: &Path) -> String {
    work_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "root".to_string())
}

impl TerminalStrategy for TmuxStrategy {
    fn name(&self) -> &'static str {
        "tmux"
    }

    fn open(&self, spawn: &SpawnConfig) -> Result<Box<dyn Channel>, TerminalError> {
        let fail = |detail: String| TerminalError::new("tmux", spawn, detail);
        let session = tmux::session_name(&label_for(&spawn.work_dir));

        if tmux::session_exists(&session) {
            warn!(session = %session, "replacing existing tmux session");
            tmux::kill_session(&session).map_err(|e| fail(format!("{e:#}")))?;
        }

        let log_path = paths::state_dir(&spawn.work_dir).join("pane.log");
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| fail(format!("failed to create {}: {e}", parent.display())))?;
        }
        File::create(&log_path)
            .map_err(|e| fail(format!("failed to reset {}: {e}", log_path.display())))?;

        let env: &[(String, String)] = if self.session_env {
            &spawn.env
        } else {
            if !spawn.env.is_empty() {
                warn!(session = %session, "tmux < 3.0 cannot set session environment; ignoring agent env");
            }
            &[]
        };

        tmux::create_session(&session, &spawn.program, &spawn.args, &spawn.work_dir, env)
            .map_err(|e| fail(format!("{e:#}")))?;
        if let Err(e) = tmux::setup_pipe_pane(&session, &log_path) {
            let _ = tmux::kill_session(&session);
            return Err(fail(format!("{e:#}")));
        }

        // Output printed before pipe-pane attached is only on screen.
        let seed = tmux::capture_pane(&session)
            .ok()
            .filter(|text| !text.trim().is_empty());

        Ok(Box::new(TmuxChannel {
            session,
            log_path,
            offset: 0,
            pending: Vec::new(),
            seed,
            closed: false,
        }))
    }

    fn attach_hint(&self, label: &str) -> Option<String> {
        Some(tmux::attach_hint(&tmux::session_name(label)))
    }
}

pub struct TmuxChannel {
    session: String,
    log_path: PathBuf,
    offset: u64,
    pending: Vec<u8>,
    seed: Option<String>,
    closed: bool,
}

impl TmuxChannel {
    fn read_new_bytes(&mut self) -> Result<usize, ChannelError> {
        let mut file = match File::open(&self.log_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(ChannelError::Io(e.to_string())),
        };
        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| ChannelError::Io(e.to_string()))?;
        let read = file
            .read_to_end(&mut self.pending)
            .map_err(|e| ChannelError::Io(e.to_string()))?;
        self.offset += read as u64;
        Ok(read)
    }
}

impl Channel for TmuxChannel {
    fn send(&mut self, text: &str) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        let body = text.trim_end_matches('\r');
        let press_enter = body.len() != text.len();
        tmux::send_keys(&self.session, body, press_enter).map_err(|e| {
            if tmux::session_exists(&self.session) {
                ChannelError::Io(format!("{e:#}"))
            } else {
                ChannelError::Closed
            }
        })
    }

    fn read_available(&mut self, timeout: Duration) -> Result<String, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        if let Some(seed) = self.seed.take() {
            return Ok(seed);
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.read_new_bytes()? > 0 {
                return Ok(decode_utf8(&mut self.pending));
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(FILE_POLL.min(deadline - now));
        }

        if !tmux::session_exists(&self.session) {
            // Pick up anything written between the last read and the exit.
            self.read_new_bytes()?;
            if self.pending.is_empty() {
                return Err(ChannelError::Closed);
            }
            let rest = String::from_utf8_lossy(&self.pending).to_string();
            self.pending.clear();
            return Ok(rest);
        }
        Ok(String::new())
    }

    fn close(&mut self, mode: CloseMode) {
        if self.closed {
            return;
        }
        self.closed = true;
        let result = match mode {
            CloseMode::Detach => tmux::stop_pipe_pane(&self.session),
            CloseMode::Terminate => tmux::kill_session(&self.session),
        };
        match result {
            Ok(()) => debug!(session = %self.session, ?mode, "tmux channel closed"),
            Err(e) => debug!(session = %self.session, error = %e, "tmux close failed"),
        }
    }
}
