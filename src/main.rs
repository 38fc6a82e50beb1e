use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use coderun::agent::{AgentAdapter, adapter_from_name};
use coderun::cli::{Cli, Command, Selection};
use coderun::config::{Overrides, ProjectConfig, RunConfig};
use coderun::error::ConfigError;
use coderun::log::{ExecutionLog, FanoutObserver, TracingObserver};
use coderun::scheduler::{CancelToken, Scheduler};
use coderun::{report, scanner, stages, terminal};

struct RunOptions {
    selection: Selection,
    max_parallel: Option<usize>,
    terminal: Option<String>,
    probe_timeout: Option<u64>,
    step_timeout: Option<u64>,
    no_log: bool,
    json: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let quiet = matches!(&cli.command, Command::Config { .. } | Command::Stages { .. });

    let filter = match cli.verbose {
        0 if quiet => "coderun=warn",
        0 => "coderun=info",
        1 => "coderun=debug",
        _ => "coderun=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Run {
            base,
            selection,
            max_parallel,
            terminal,
            probe_timeout,
            step_timeout,
            no_log,
            json,
        } => run(
            &base,
            RunOptions {
                selection,
                max_parallel,
                terminal,
                probe_timeout,
                step_timeout,
                no_log,
                json,
            },
        ),
        Command::Plan {
            base,
            selection,
            json,
        } => plan(&base, &selection, json),
        Command::Stages { pattern } => list_stages(pattern.as_deref()),
        Command::Config { base, json } => show_config(base, json),
    }
}

/// Load the project config for `base` and merge `overrides` into it.
fn load_run_config(base: &Path, overrides: &Overrides) -> Result<RunConfig> {
    let base = std::fs::canonicalize(base).unwrap_or_else(|_| base.to_path_buf());
    let (project, config_path) = ProjectConfig::load(&base)?;
    match config_path {
        Some(ref p) => info!("loaded config from {}", p.display()),
        None => info!("no .coderun/config.toml found, using defaults"),
    }
    Ok(project.into_run_config(base, overrides)?)
}

fn run(base: &Path, options: RunOptions) -> Result<ExitCode> {
    let overrides = Overrides {
        max_parallel: options.max_parallel,
        terminal: options.terminal,
        probe_timeout_secs: options.probe_timeout,
        step_timeout_secs: options.step_timeout,
        no_log: options.no_log,
        ..options.selection.overrides()
    };
    let config = load_run_config(base, &overrides)?;

    let agent: Arc<dyn AgentAdapter> =
        adapter_from_name(&config.agent_name, &config.agent, config.silence_fallback)
            .ok_or_else(|| ConfigError::UnknownAgent(config.agent_name.clone()))?
            .into();
    let strategy = terminal::strategy_from_name(&config.terminal)?;

    let mut observer = FanoutObserver::new().with(Arc::new(TracingObserver));
    if config.execution_log {
        match ExecutionLog::for_run(&config.base_path) {
            Ok(log) => {
                info!(path = %log.path().display(), "writing execution log");
                observer = observer.with(Arc::new(log));
            }
            Err(e) => warn!(error = %e, "execution log disabled"),
        }
    }

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        on_interrupt.cancel();
    })
    .context("failed to install Ctrl-C handler")?;

    let scheduler = Scheduler::new(
        Arc::new(config),
        Arc::clone(&strategy),
        agent,
        Arc::new(observer),
    );
    let summary = scheduler.run_base(&cancel)?;

    if options.json {
        println!("{}", report::render_summary_json(&summary)?);
    } else {
        print!("{}", report::render_summary(&summary, strategy.as_ref()));
    }

    Ok(if summary.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn plan(base: &Path, selection: &Selection, json: bool) -> Result<ExitCode> {
    let config = load_run_config(base, &selection.overrides())?;
    let all = scanner::scan_all(&config.base_path, &config.exclude_set()?)?;
    let entries = report::plan(&all, &config.payload_resolver());

    if json {
        println!("{}", report::render_plan_json(&entries)?);
    } else {
        print!(
            "{}",
            report::render_plan(&config.base_path, config.stage.as_deref(), &entries)
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn list_stages(pattern: Option<&str>) -> Result<ExitCode> {
    let Some(pattern) = pattern else {
        print!("{}", stages::render_catalog());
        return Ok(ExitCode::SUCCESS);
    };

    let compiled = stages::compile(pattern)?;
    let matched = stages::matching(&compiled);
    if matched.is_empty() {
        println!(
            "No catalog stage matches '{pattern}'. Custom stages work when their payload files exist."
        );
    }
    for stage in matched {
        let optional = if stage.optional { " (optional)" } else { "" };
        println!("  {:<30} {}{optional}", stage.name, stage.description);
    }
    Ok(ExitCode::SUCCESS)
}

fn show_config(base: Option<PathBuf>, json: bool) -> Result<ExitCode> {
    let base = match base {
        Some(base) => base,
        None => std::env::current_dir()
            .context("failed to get current directory (was it deleted?)")?,
    };
    let (project, config_path) = ProjectConfig::load(&base)?;

    if json {
        let config = project.into_run_config(base, &Overrides::default())?;
        println!(
            "{}",
            report::render_config_json(&config, config_path.as_deref())?
        );
    } else {
        println!(
            "# source: {}",
            report::config_source_label(config_path.as_deref())
        );
        print!("{}", project.to_toml()?);
    }
    Ok(ExitCode::SUCCESS)
}
