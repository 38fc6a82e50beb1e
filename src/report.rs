//! Human and JSON renderings of plans, run summaries and configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::RunConfig;
use crate::payload::{PayloadResolver, PayloadSlot, StepKind};
use crate::scanner::WorkUnit;
use crate::scheduler::RunSummary;
use crate::session::{LaunchResult, SessionPath, SessionState};
use crate::terminal::TerminalStrategy;

/// One line of the run summary, as emitted by `--json`.
#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub unit: String,
    pub path: PathBuf,
    pub final_state: SessionState,
    pub states: Vec<SessionState>,
    pub session: Option<SessionPath>,
    pub delivered: Vec<StepKind>,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

impl From<&LaunchResult> for UnitReport {
    fn from(result: &LaunchResult) -> Self {
        Self {
            unit: result.unit.label.clone(),
            path: result.unit.path.clone(),
            final_state: result.final_state,
            states: result.states.clone(),
            session: result.path,
            delivered: result.delivered.clone(),
            elapsed_ms: result.duration.as_millis() as u64,
            error: result.error.as_ref().map(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct SummaryReport {
    units: Vec<UnitReport>,
    total: usize,
    completed: usize,
    failed: usize,
    success_rate: f64,
    duration_ms: u64,
    cancelled: bool,
}

pub fn render_summary_json(summary: &RunSummary) -> Result<String> {
    let report = SummaryReport {
        units: summary.results.iter().map(UnitReport::from).collect(),
        total: summary.total(),
        completed: summary.completed(),
        failed: summary.failed(),
        success_rate: summary.success_rate(),
        duration_ms: summary.duration.as_millis() as u64,
        cancelled: summary.cancelled,
    };
    serde_json::to_string_pretty(&report).context("failed to serialize run summary")
}

/// Per-unit lines, totals and attach hints for units left running.
pub fn render_summary(summary: &RunSummary, terminal: &dyn TerminalStrategy) -> String {
    let width = label_width(summary.results.iter().map(|r| r.unit.label.as_str()));
    let mut out = String::new();

    for result in &summary.results {
        let mark = if result.is_success() { "✓" } else { "✗" };
        let states = result
            .states
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" → ");
        out.push_str(&format!(
            "  {mark} {:<width$}  {states}  ({})",
            result.unit.label,
            format_elapsed(result.duration),
        ));
        if let Some(error) = &result.error {
            out.push_str(&format!("\n      error: {error}"));
        }
        out.push('\n');
    }

    if summary.cancelled {
        out.push_str("\nRun cancelled.\n");
    }
    out.push_str(&format!(
        "\n{} total, {} completed, {} failed ({:.1}% success) in {}\n",
        summary.total(),
        summary.completed(),
        summary.failed(),
        summary.success_rate(),
        format_elapsed(summary.duration),
    ));

    let hints: Vec<String> = summary
        .results
        .iter()
        .filter(|r| r.is_success())
        .filter_map(|r| terminal.attach_hint(&r.unit.label))
        .collect();
    if !hints.is_empty() {
        out.push_str("\nAttach to a session:\n");
        for hint in hints {
            out.push_str(&format!("  {hint}\n"));
        }
    }
    out
}

/// What a run would do with one directory.
#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
    pub unit: String,
    pub path: PathBuf,
    pub excluded: bool,
    pub init: Option<PathBuf>,
    pub main: Option<PathBuf>,
    pub marker: Option<PathBuf>,
}

/// Resolve payload files and stage markers for every scanned directory.
/// Excluded directories are listed without lookups.
pub fn plan(units: &[WorkUnit], resolver: &PayloadResolver) -> Vec<PlanEntry> {
    units
        .iter()
        .map(|unit| {
            let (init, main, marker) = if unit.excluded {
                (None, None, None)
            } else {
                (
                    resolver.locate(PayloadSlot::Init, &unit.path),
                    resolver.locate(PayloadSlot::Main, &unit.path),
                    resolver.marker(&unit.path),
                )
            };
            PlanEntry {
                unit: unit.label.clone(),
                path: unit.path.clone(),
                excluded: unit.excluded,
                init,
                main,
                marker,
            }
        })
        .collect()
}

pub fn render_plan(base: &Path, stage: Option<&str>, entries: &[PlanEntry]) -> String {
    let width = label_width(entries.iter().map(|e| e.unit.as_str()));
    let mut out = format!("Base: {}\n", base.display());
    if let Some(stage) = stage {
        out.push_str(&format!("Stage: {stage}\n"));
    }
    out.push('\n');

    for entry in entries {
        if entry.excluded {
            out.push_str(&format!("  - {:<width$}  excluded\n", entry.unit));
            continue;
        }
        let ready = entry.main.is_some();
        out.push_str(&format!(
            "  {} {:<width$}  main: {}\n",
            if ready { "+" } else { "!" },
            entry.unit,
            display_or_missing(entry.main.as_deref()),
        ));
        out.push_str(&format!(
            "    {:<width$}  init: {}\n",
            "",
            display_or_missing(entry.init.as_deref()),
        ));
        if let Some(marker) = &entry.marker {
            out.push_str(&format!(
                "    {:<width$}  stage marker: {} (init payload skipped on fresh start)\n",
                "",
                marker.display(),
            ));
        }
    }

    let eligible = entries.iter().filter(|e| !e.excluded).count();
    let missing = entries
        .iter()
        .filter(|e| !e.excluded && e.main.is_none())
        .count();
    out.push_str(&format!(
        "\n{eligible} eligible, {} excluded, {missing} missing a main payload\n",
        entries.len() - eligible,
    ));
    out
}

pub fn render_plan_json(entries: &[PlanEntry]) -> Result<String> {
    serde_json::to_string_pretty(entries).context("failed to serialize plan")
}

/// Effective settings for `coderun config --json`.
pub fn render_config_json(config: &RunConfig, source: Option<&Path>) -> Result<String> {
    let payload = serde_json::json!({
        "defaults": {
            "base_path": &config.base_path,
            "max_parallel": config.max_parallel,
            "terminal": &config.terminal,
            "agent": &config.agent_name,
            "stage": &config.stage,
            "exclude": &config.exclude_patterns,
            "include_hidden": config.include_hidden,
            "fallback_dir": &config.fallback_dir,
        },
        "timeouts": {
            "probe_secs": config.probe_timeout.as_secs(),
            "step_secs": config.step_timeout.as_secs(),
            "grace_secs": config.grace_period.as_secs(),
            "silence_fallback_millis": config.silence_fallback.as_millis() as u64,
            "poll_millis": config.poll_interval.as_millis() as u64,
        },
        "agent": {
            "program": &config.agent.program,
            "resume_args": &config.agent.resume_args,
            "fresh_args": &config.agent.fresh_args,
            "init_command": &config.agent.init_command,
            "max_acknowledgements": config.max_acknowledgements,
        },
        "logging": {
            "execution_log": config.execution_log,
        },
        "source_path": config_source_label(source),
    });
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

pub fn config_source_label(source: Option<&Path>) -> String {
    match source {
        Some(path) => path.display().to_string(),
        None => "(defaults, no .coderun/config.toml found)".to_string(),
    }
}

/// `0.4s`, `12.0s`, `3m07s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", elapsed.as_secs_f64())
    }
}

fn label_width<'a>(labels: impl Iterator<Item = &'a str>) -> usize {
    labels.map(|l| l.chars().count()).max().unwrap_or(0)
}

fn display_or_missing(path: Option<&Path>) -> String {
    path.map_or_else(|| "(not found)".to_string(), |p| p.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::error::UnitError;
    use crate::terminal::pty::PtyStrategy;
    use crate::terminal::tmux::TmuxStrategy;

    fn result(label: &str, states: Vec<SessionState>, error: Option<UnitError>) -> LaunchResult {
        LaunchResult {
            unit: WorkUnit::new(PathBuf::from("/work").join(label)),
            final_state: *states.last().unwrap(),
            states,
            error,
            duration: Duration::from_millis(1500),
            delivered: vec![StepKind::Main],
            path: Some(SessionPath::Resumed),
        }
    }

    fn summary() -> RunSummary {
        use crate::session::SessionState::*;
        RunSummary {
            results: vec![
                result(
                    "alpha",
                    vec![Unknown, Probing, Resumable, Injecting, Completed],
                    None,
                ),
                result("beta", vec![Unknown, Failed], Some(UnitError::Cancelled)),
            ],
            duration: Duration::from_secs(75),
            peak_in_flight: 2,
            cancelled: false,
        }
    }

    #[test]
    fn summary_lists_state_path_and_totals() {
        let out = render_summary(&summary(), &PtyStrategy::default());
        assert!(
            out.contains("✓ alpha  unknown → probing → resumable → injecting → completed  (1.5s)"),
            "{out}"
        );
        assert!(out.contains("✗ beta"), "{out}");
        assert!(out.contains("error: run cancelled"), "{out}");
        assert!(
            out.contains("2 total, 1 completed, 1 failed (50.0% success) in 1m15s"),
            "{out}"
        );
        assert!(!out.contains("Attach"), "{out}");
    }

    #[test]
    fn tmux_summary_offers_attach_for_completed_units() {
        let out = render_summary(&summary(), &TmuxStrategy::with_version("tmux 3.4"));
        assert!(out.contains("tmux attach -t coderun-alpha"), "{out}");
        assert!(!out.contains("coderun-beta"), "{out}");
    }

    #[test]
    fn summary_json_has_one_record_per_unit() {
        let json = render_summary_json(&summary()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["units"].as_array().unwrap().len(), 2);
        assert_eq!(value["units"][0]["final_state"], "completed");
        assert_eq!(value["units"][0]["session"], "resumed");
        assert_eq!(value["units"][1]["error"], "run cancelled");
        assert_eq!(value["units"][1]["elapsed_ms"], 1500);
        assert_eq!(value["success_rate"], 50.0);
    }

    #[test]
    fn plan_resolves_payloads_and_markers() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path();
        fs::write(base.join("coderun.md"), "main").unwrap();
        fs::create_dir_all(base.join("alpha").join(".coderun")).unwrap();
        fs::write(base.join("alpha").join(".coderun").join("init.done"), "").unwrap();
        fs::write(base.join("alpha").join("coderun_init.md"), "init").unwrap();
        fs::create_dir(base.join("node_modules")).unwrap();

        let mut skipped = WorkUnit::new(base.join("node_modules"));
        skipped.excluded = true;
        let units = vec![WorkUnit::new(base.join("alpha")), skipped];
        let resolver = PayloadResolver::new(base.to_path_buf(), None, None);

        let entries = plan(&units, &resolver);
        assert_eq!(entries[0].main, Some(base.join("coderun.md")));
        assert_eq!(entries[0].init, Some(base.join("alpha").join("coderun_init.md")));
        assert!(entries[0].marker.is_some());
        assert!(entries[1].excluded);
        assert!(entries[1].main.is_none());

        let out = render_plan(base, None, &entries);
        assert!(out.contains("stage marker"), "{out}");
        assert!(out.contains("node_modules  excluded"), "{out}");
        assert!(out.contains("1 eligible, 1 excluded, 0 missing a main payload"), "{out}");

        let json: serde_json::Value =
            serde_json::from_str(&render_plan_json(&entries).unwrap()).unwrap();
        assert_eq!(json[1]["excluded"], true);
    }

    #[test]
    fn config_json_reports_source_and_timeouts() {
        let config = RunConfig::for_base(PathBuf::from("/work")).unwrap();
        let json = render_config_json(&config, None).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["defaults"]["max_parallel"], 3);
        assert_eq!(value["timeouts"]["probe_secs"], 5);
        assert_eq!(value["agent"]["init_command"], "/init");
        assert_eq!(
            value["source_path"],
            "(defaults, no .coderun/config.toml found)"
        );
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(Duration::from_millis(400)), "0.4s");
        assert_eq!(format_elapsed(Duration::from_secs(187)), "3m07s");
    }
}
