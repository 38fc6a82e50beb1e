use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::Overrides;

#[derive(Parser, Debug)]
#[command(
    name = "coderun",
    about = "Launch and drive interactive coding-agent sessions across many project directories",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start or resume an agent session in every project under a base directory
    Run {
        /// Directory whose immediate subdirectories are the projects
        base: PathBuf,

        #[command(flatten)]
        selection: Selection,

        /// Maximum number of sessions driven at once
        #[arg(long, short = 'j')]
        max_parallel: Option<usize>,

        /// Terminal strategy: auto, tmux or pty
        #[arg(long)]
        terminal: Option<String>,

        /// Seconds to wait for the session listing
        #[arg(long, value_name = "SECS")]
        probe_timeout: Option<u64>,

        /// Seconds to wait for each readiness signal while sending payloads
        #[arg(long, value_name = "SECS")]
        step_timeout: Option<u64>,

        /// Do not write a JSONL execution log
        #[arg(long)]
        no_log: bool,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show which directories would run and which payload files they would get
    Plan {
        base: PathBuf,

        #[command(flatten)]
        selection: Selection,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the workflow stages, or the ones matching a pattern
    Stages {
        /// Stage name or glob pattern (e.g. "opt_*")
        pattern: Option<String>,
    },

    /// Show the effective configuration
    Config {
        /// Directory to resolve the configuration for (defaults to the current directory)
        base: Option<PathBuf>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Options shared by `run` and `plan`.
#[derive(Args, Debug, Clone, Default)]
pub struct Selection {
    /// Stage whose payload files are used (glob patterns allowed)
    #[arg(long, short = 's')]
    pub stage: Option<String>,

    /// Directory names or glob patterns to skip (repeatable, comma separated)
    #[arg(long, short = 'x', value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// Also consider directories whose name starts with '.'
    #[arg(long)]
    pub include_hidden: bool,

    /// Last directory searched for payload files
    #[arg(long, value_name = "DIR")]
    pub fallback_dir: Option<PathBuf>,
}

impl Selection {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            stage: self.stage.clone(),
            exclude: self.exclude.clone(),
            include_hidden: self.include_hidden,
            fallback_dir: self.fallback_dir.clone(),
            ..Overrides::default()
        }
    }
}
