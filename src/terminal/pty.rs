//! Headless pseudo-terminal strategy.
//!
//! Spawns the agent in a PTY owned by this process. A reader thread forwards
//! raw output chunks over an mpsc channel so reads can time out. The session
//! cannot be attached to, so closing always terminates the child.

use std::io::{Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::{debug, info, warn};

use super::{Channel, ChannelError, CloseMode, TerminalError, TerminalStrategy, decode_utf8};
use crate::agent::SpawnConfig;

#[derive(Debug, Clone, Copy)]
pub struct PtyStrategy {
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtyStrategy {
    fn default() -> Self {
        Self {
            rows: 50,
            cols: 220,
        }
    }
}

impl TerminalStrategy for PtyStrategy {
    fn name(&self) -> &'static str {
        "pty"
    }

    fn open(&self, spawn: &SpawnConfig) -> Result<Box<dyn Channel>, TerminalError> {
        let fail = |detail: String| TerminalError::new("pty", spawn, detail);

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: self.rows,
                cols: self.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| fail(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&spawn.program);
        cmd.args(&spawn.args);
        cmd.cwd(&spawn.work_dir);
        for (key, val) in &spawn.env {
            cmd.env(key, val);
        }

        info!(
            program = %spawn.program,
            work_dir = %spawn.work_dir.display(),
            "spawning agent in PTY"
        );

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| fail(format!("failed to spawn {}: {e}", spawn.program)))?;

        // Only the master side is used from here on.
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| fail(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| fail(format!("failed to take PTY writer: {e}")))?;

        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("PTY read error (process likely exited): {e}");
                        break;
                    }
                }
            }
        });

        Ok(Box::new(PtyChannel {
            _master: pair.master,
            child,
            writer,
            rx,
            pending: Vec::new(),
            closed: false,
        }))
    }
}

pub struct PtyChannel {
    _master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    closed: bool,
}

impl Channel for PtyChannel {
    fn send(&mut self, text: &str) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        self.writer
            .write_all(text.as_bytes())
            .and_then(|()| self.writer.flush())
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::BrokenPipe => ChannelError::Closed,
                _ => ChannelError::Io(e.to_string()),
            })
    }

    fn read_available(&mut self, timeout: Duration) -> Result<String, ChannelError> {
        match self.rx.recv_timeout(timeout) {
            Ok(chunk) => self.pending.extend_from_slice(&chunk),
            Err(RecvTimeoutError::Timeout) => return Ok(String::new()),
            Err(RecvTimeoutError::Disconnected) => {
                if self.pending.is_empty() {
                    return Err(ChannelError::Closed);
                }
                let rest = String::from_utf8_lossy(&self.pending).to_string();
                self.pending.clear();
                return Ok(rest);
            }
        }
        while let Ok(chunk) = self.rx.try_recv() {
            self.pending.extend_from_slice(&chunk);
        }
        Ok(decode_utf8(&mut self.pending))
    }

    fn close(&mut self, _mode: CloseMode) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.child.kill() {
            debug!(error = %e, "PTY child already gone");
        }
        if let Err(e) = self.child.wait() {
            warn!(error = %e, "failed to reap PTY child");
        }
    }
}

impl Drop for PtyChannel {
    fn drop(&mut self) {
        self.close(CloseMode::Terminate);
    }
}
