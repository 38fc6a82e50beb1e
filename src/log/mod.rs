//! Run observation: diagnostics and the structured execution log.
//!
//! The engine reports what happens through [`RunObserver`]. Two sinks exist:
//! [`TracingObserver`] for human-facing diagnostics and [`ExecutionLog`],
//! which writes one JSON object per line to
//! `<base>/.coderun/logs/run-<timestamp>-<id>.jsonl`.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::payload::StepKind;
use crate::scanner::WorkUnit;
use crate::scheduler::RunSummary;
use crate::session::{LaunchResult, SessionPath, SessionState};

/// Facts about a run, reported once before dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub base: PathBuf,
    pub units: usize,
    pub max_parallel: usize,
    pub terminal: String,
    pub stage: Option<String>,
}

/// Receives engine events. Called from unit threads; implementations must
/// not block for long.
pub trait RunObserver: Send + Sync {
    fn run_started(&self, _run: &RunInfo) {}
    fn unit_queued(&self, _unit: &WorkUnit) {}
    fn state_changed(&self, _unit: &WorkUnit, _from: SessionState, _to: SessionState) {}
    fn step_delivered(&self, _unit: &WorkUnit, _step: StepKind, _bytes: usize) {}
    fn unit_finished(&self, _result: &LaunchResult) {}
    fn run_cancelled(&self, _queued: usize, _in_flight: usize) {}
    fn run_completed(&self, _summary: &RunSummary) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl RunObserver for NullObserver {}

/// Diagnostics through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl RunObserver for TracingObserver {
    fn run_started(&self, run: &RunInfo) {
        info!(
            base = %run.base.display(),
            units = run.units,
            max_parallel = run.max_parallel,
            terminal = %run.terminal,
            stage = ?run.stage,
            "run started"
        );
    }

    fn unit_queued(&self, unit: &WorkUnit) {
        debug!(unit = %unit.label, path = %unit.path.display(), "unit queued");
    }

    fn state_changed(&self, unit: &WorkUnit, from: SessionState, to: SessionState) {
        debug!(unit = %unit.label, ?from, ?to, "state changed");
    }

    fn step_delivered(&self, unit: &WorkUnit, step: StepKind, bytes: usize) {
        info!(unit = %unit.label, %step, bytes, "delivered");
    }

    fn unit_finished(&self, result: &LaunchResult) {
        match &result.error {
            None => info!(
                unit = %result.unit.label,
                state = ?result.final_state,
                path = ?result.path,
                elapsed_ms = result.duration.as_millis() as u64,
                "unit finished"
            ),
            Some(error) => warn!(
                unit = %result.unit.label,
                state = ?result.final_state,
                elapsed_ms = result.duration.as_millis() as u64,
                error = %error,
                "unit failed"
            ),
        }
    }

    fn run_cancelled(&self, queued: usize, in_flight: usize) {
        warn!(queued, in_flight, "run cancelled");
    }

    fn run_completed(&self, summary: &RunSummary) {
        info!(
            total = summary.total(),
            completed = summary.completed(),
            failed = summary.failed(),
            elapsed_ms = summary.duration.as_millis() as u64,
            "run completed"
        );
    }
}

/// Forwards every event to each inner observer, in order.
#[derive(Default, Clone)]
pub struct FanoutObserver {
    observers: Vec<Arc<dyn RunObserver>>,
}

impl FanoutObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl RunObserver for FanoutObserver {
    fn run_started(&self, run: &RunInfo) {
        self.observers.iter().for_each(|o| o.run_started(run));
    }

    fn unit_queued(&self, unit: &WorkUnit) {
        self.observers.iter().for_each(|o| o.unit_queued(unit));
    }

    fn state_changed(&self, unit: &WorkUnit, from: SessionState, to: SessionState) {
        self.observers
            .iter()
            .for_each(|o| o.state_changed(unit, from, to));
    }

    fn step_delivered(&self, unit: &WorkUnit, step: StepKind, bytes: usize) {
        self.observers
            .iter()
            .for_each(|o| o.step_delivered(unit, step, bytes));
    }

    fn unit_finished(&self, result: &LaunchResult) {
        self.observers.iter().for_each(|o| o.unit_finished(result));
    }

    fn run_cancelled(&self, queued: usize, in_flight: usize) {
        self.observers
            .iter()
            .for_each(|o| o.run_cancelled(queued, in_flight));
    }

    fn run_completed(&self, summary: &RunSummary) {
        self.observers.iter().for_each(|o| o.run_completed(summary));
    }
}

/// A structured event in the execution log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// RFC 3339 timestamp.
    pub timestamp: String,
    pub run_id: String,
    #[serde(flatten)]
    pub event: LogEvent,
}

/// All event types that can appear in the execution log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    RunStarted(RunInfo),
    UnitQueued {
        unit: String,
        path: String,
    },
    StateChanged {
        unit: String,
        from: SessionState,
        to: SessionState,
    },
    StepDelivered {
        unit: String,
        step: StepKind,
        bytes: usize,
    },
    UnitFinished {
        unit: String,
        state: SessionState,
        path: Option<SessionPath>,
        duration_ms: u64,
        error: Option<String>,
    },
    RunCancelled {
        queued: usize,
        in_flight: usize,
    },
    RunCompleted {
        total: usize,
        completed: usize,
        failed: usize,
        success_rate: f64,
        duration_ms: u64,
    },
}

/// Writer for JSON lines execution logs.
pub struct ExecutionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
    run_id: String,
}

impl ExecutionLog {
    /// Open a log at `path`, creating parent directories. Appends to an
    /// existing file.
    pub fn new(path: &Path, run_id: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
            run_id: run_id.to_string(),
        })
    }

    /// New log for a run over `base`, named after the start time and a
    /// fresh run id.
    pub fn for_run(base: &Path) -> Result<Self> {
        let run_id = new_run_id();
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let path = crate::paths::log_dir(base).join(format!("run-{stamp}-{run_id}.jsonl"));
        Self::new(&path, &run_id)
    }

    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            run_id: self.run_id.clone(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;
        Ok(())
    }

    fn record(&self, event: LogEvent) {
        if let Err(e) = self.log(event) {
            warn!(path = %self.path.display(), error = %e, "execution log write failed");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

/// Short random id that tells runs apart in log names.
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

impl RunObserver for ExecutionLog {
    fn run_started(&self, run: &RunInfo) {
        self.record(LogEvent::RunStarted(run.clone()));
    }

    fn unit_queued(&self, unit: &WorkUnit) {
        self.record(LogEvent::UnitQueued {
            unit: unit.label.clone(),
            path: unit.path.display().to_string(),
        });
    }

    fn state_changed(&self, unit: &WorkUnit, from: SessionState, to: SessionState) {
        self.record(LogEvent::StateChanged {
            unit: unit.label.clone(),
            from,
            to,
        });
    }

    fn step_delivered(&self, unit: &WorkUnit, step: StepKind, bytes: usize) {
        self.record(LogEvent::StepDelivered {
            unit: unit.label.clone(),
            step,
            bytes,
        });
    }

    fn unit_finished(&self, result: &LaunchResult) {
        self.record(LogEvent::UnitFinished {
            unit: result.unit.label.clone(),
            state: result.final_state,
            path: result.path,
            duration_ms: result.duration.as_millis() as u64,
            error: result.error.as_ref().map(|e| e.to_string()),
        });
    }

    fn run_cancelled(&self, queued: usize, in_flight: usize) {
        self.record(LogEvent::RunCancelled { queued, in_flight });
    }

    fn run_completed(&self, summary: &RunSummary) {
        self.record(LogEvent::RunCompleted {
            total: summary.total(),
            completed: summary.completed(),
            failed: summary.failed(),
            success_rate: summary.success_rate(),
            duration_ms: summary.duration.as_millis() as u64,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::time::Duration;

    use crate::error::UnitError;

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        let file = File::open(path).unwrap();
        std::io::BufReader::new(file)
            .lines()
            .map(|l| serde_json::from_str(&l.unwrap()).unwrap())
            .collect()
    }

    fn unit(label: &str) -> WorkUnit {
        WorkUnit::new(PathBuf::from("/work").join(label))
    }

    #[test]
    fn writes_jsonl_with_tagged_events() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs").join("run.jsonl");
        let log = ExecutionLog::new(&path, "abcd1234").unwrap();

        let alpha = unit("alpha");
        log.unit_queued(&alpha);
        log.state_changed(&alpha, SessionState::Unknown, SessionState::Probing);
        log.step_delivered(&alpha, StepKind::Main, 42);

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event"], "unit_queued");
        assert_eq!(lines[0]["data"]["unit"], "alpha");
        assert_eq!(lines[0]["run_id"], "abcd1234");
        assert_eq!(lines[1]["event"], "state_changed");
        assert_eq!(lines[1]["data"]["from"], "unknown");
        assert_eq!(lines[1]["data"]["to"], "probing");
        assert_eq!(lines[2]["data"]["step"], "main");
        assert_eq!(lines[2]["data"]["bytes"], 42);
    }

    #[test]
    fn timestamps_are_rfc3339() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.jsonl");
        let log = ExecutionLog::new(&path, "id").unwrap();
        log.run_cancelled(2, 1);

        let lines = read_lines(&path);
        let stamp = lines[0]["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok(), "{stamp}");
        assert_eq!(lines[0]["data"]["queued"], 2);
    }

    #[test]
    fn unit_finished_records_error_text() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.jsonl");
        let log = ExecutionLog::new(&path, "id").unwrap();

        let result = LaunchResult {
            unit: unit("beta"),
            final_state: SessionState::Failed,
            states: vec![SessionState::Unknown, SessionState::Failed],
            error: Some(UnitError::Cancelled),
            duration: Duration::from_millis(1500),
            delivered: vec![],
            path: None,
        };
        log.unit_finished(&result);

        let lines = read_lines(&path);
        assert_eq!(lines[0]["event"], "unit_finished");
        assert_eq!(lines[0]["data"]["state"], "failed");
        assert_eq!(lines[0]["data"]["duration_ms"], 1500);
        assert_eq!(lines[0]["data"]["error"], "run cancelled");
    }

    #[test]
    fn for_run_names_file_after_run_id() {
        let tmp = tempfile::tempdir().unwrap();
        let log = ExecutionLog::for_run(tmp.path()).unwrap();
        let name = log.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("run-"), "{name}");
        assert!(name.ends_with(&format!("-{}.jsonl", log.run_id())), "{name}");
        assert!(log.path().starts_with(tmp.path().join(".coderun").join("logs")));
    }

    #[test]
    fn run_ids_are_short_and_distinct() {
        let a = new_run_id();
        let b = new_run_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn fanout_reaches_every_observer() {
        let tmp = tempfile::tempdir().unwrap();
        let first = Arc::new(ExecutionLog::new(&tmp.path().join("a.jsonl"), "a").unwrap());
        let second = Arc::new(ExecutionLog::new(&tmp.path().join("b.jsonl"), "b").unwrap());
        let fanout = FanoutObserver::new()
            .with(first.clone())
            .with(second.clone())
            .with(Arc::new(TracingObserver));

        fanout.unit_queued(&unit("gamma"));

        assert_eq!(read_lines(first.path()).len(), 1);
        assert_eq!(read_lines(second.path()).len(), 1);
    }
}
