use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::payload::PayloadResolver;
use crate::paths::STATE_DIR;
use crate::scanner::ExcludeSet;
use crate::stages;

const CONFIG_FILENAME: &str = "config.toml";

const TERMINALS: &[&str] = &["auto", "tmux", "pty"];

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Defaults {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_terminal")]
    pub terminal: String,
    #[serde(default = "default_agent")]
    pub agent: String,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub include_hidden: bool,
    #[serde(default)]
    pub fallback_dir: Option<PathBuf>,
}

fn default_max_parallel() -> usize {
    3
}

fn default_terminal() -> String {
    "auto".to_string()
}

fn default_agent() -> String {
    "claude".to_string()
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            terminal: default_terminal(),
            agent: default_agent(),
            stage: None,
            exclude: Vec::new(),
            include_hidden: false,
            fallback_dir: None,
        }
    }
}

/// Prompt wait budgets.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Timeouts {
    #[serde(default = "default_probe_secs")]
    pub probe_secs: u64,
    #[serde(default = "default_step_secs")]
    pub step_secs: u64,
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    #[serde(default = "default_silence_fallback_millis")]
    pub silence_fallback_millis: u64,
    #[serde(default = "default_poll_millis")]
    pub poll_millis: u64,
}

fn default_probe_secs() -> u64 {
    5
}

fn default_step_secs() -> u64 {
    120
}

fn default_grace_secs() -> u64 {
    10
}

fn default_silence_fallback_millis() -> u64 {
    3000
}

fn default_poll_millis() -> u64 {
    100
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            probe_secs: default_probe_secs(),
            step_secs: default_step_secs(),
            grace_secs: default_grace_secs(),
            silence_fallback_millis: default_silence_fallback_millis(),
            poll_millis: default_poll_millis(),
        }
    }
}

/// How the interactive agent is started and answered.
///
/// ```toml
/// [agent]
/// program = "claude"
/// resume_args = ["--resume", "--dangerously-skip-permissions"]
/// init_command = "/init"
///
/// [agent.env]
/// CLAUDE_CONFIG_DIR = "/home/me/.claude-work"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AgentSettings {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_resume_args")]
    pub resume_args: Vec<String>,
    #[serde(default = "default_fresh_args")]
    pub fresh_args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_init_command")]
    pub init_command: String,
    #[serde(default = "default_enter")]
    pub resume_selection: String,
    #[serde(default = "default_enter")]
    pub acknowledgement: String,
    #[serde(default = "default_max_acknowledgements")]
    pub max_acknowledgements: usize,
}

fn default_program() -> String {
    "claude".to_string()
}

fn default_resume_args() -> Vec<String> {
    vec![
        "--resume".to_string(),
        "--dangerously-skip-permissions".to_string(),
    ]
}

fn default_fresh_args() -> Vec<String> {
    vec!["--dangerously-skip-permissions".to_string()]
}

fn default_init_command() -> String {
    "/init".to_string()
}

fn default_enter() -> String {
    "\r".to_string()
}

fn default_max_acknowledgements() -> usize {
    8
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            resume_args: default_resume_args(),
            fresh_args: default_fresh_args(),
            env: BTreeMap::new(),
            init_command: default_init_command(),
            resume_selection: default_enter(),
            acknowledgement: default_enter(),
            max_acknowledgements: default_max_acknowledgements(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_execution_log")]
    pub execution_log: bool,
}

fn default_execution_log() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            execution_log: default_execution_log(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct ProjectConfig {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ProjectConfig {
    /// Search upward from `base`, then from the current directory, for a
    /// `.coderun/config.toml` file and load it. Returns the default config if
    /// no file is found.
    pub fn load(base: &Path) -> Result<(Self, Option<PathBuf>)> {
        let found = Self::find_config_file(base).or_else(|| {
            std::env::current_dir()
                .ok()
                .and_then(|cwd| Self::find_config_file(&cwd))
        });
        match found {
            Some(path) => Ok((Self::load_file(&path)?, Some(path))),
            None => Ok((ProjectConfig::default(), None)),
        }
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(STATE_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render config as TOML")
    }

    /// Merge CLI overrides and validate into the run's immutable settings.
    pub fn into_run_config(
        self,
        base_path: PathBuf,
        overrides: &Overrides,
    ) -> Result<RunConfig, ConfigError> {
        let Self {
            defaults,
            timeouts,
            agent,
            logging,
        } = self;

        let mut exclude_patterns = defaults.exclude;
        exclude_patterns.extend(overrides.exclude.iter().cloned());

        let config = RunConfig {
            base_path,
            exclude_patterns,
            include_hidden: defaults.include_hidden || overrides.include_hidden,
            max_parallel: overrides.max_parallel.unwrap_or(defaults.max_parallel),
            probe_timeout: Duration::from_secs(
                overrides.probe_timeout_secs.unwrap_or(timeouts.probe_secs),
            ),
            step_timeout: Duration::from_secs(
                overrides.step_timeout_secs.unwrap_or(timeouts.step_secs),
            ),
            grace_period: Duration::from_secs(timeouts.grace_secs),
            silence_fallback: Duration::from_millis(timeouts.silence_fallback_millis),
            poll_interval: Duration::from_millis(timeouts.poll_millis),
            max_acknowledgements: agent.max_acknowledgements,
            terminal: overrides.terminal.clone().unwrap_or(defaults.terminal),
            agent_name: defaults.agent,
            agent,
            stage: overrides.stage.clone().or(defaults.stage),
            fallback_dir: overrides.fallback_dir.clone().or(defaults.fallback_dir),
            execution_log: logging.execution_log && !overrides.no_log,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Values given on the command line. `None`/empty means "use the config".
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub max_parallel: Option<usize>,
    pub terminal: Option<String>,
    pub stage: Option<String>,
    /// Appended to the configured exclusions.
    pub exclude: Vec<String>,
    pub include_hidden: bool,
    pub fallback_dir: Option<PathBuf>,
    pub probe_timeout_secs: Option<u64>,
    pub step_timeout_secs: Option<u64>,
    pub no_log: bool,
}

/// Settings for one run. Built once, shared read-only.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub base_path: PathBuf,
    pub exclude_patterns: Vec<String>,
    pub include_hidden: bool,
    pub max_parallel: usize,
    pub probe_timeout: Duration,
    /// Budget for each readiness gate during injection.
    pub step_timeout: Duration,
    pub grace_period: Duration,
    pub silence_fallback: Duration,
    pub poll_interval: Duration,
    pub max_acknowledgements: usize,
    /// Terminal strategy selector (`auto`, `tmux`, `pty`).
    pub terminal: String,
    pub agent_name: String,
    pub agent: AgentSettings,
    pub stage: Option<String>,
    pub fallback_dir: Option<PathBuf>,
    pub execution_log: bool,
}

impl RunConfig {
    /// Defaults for `base_path` with no config file and no overrides.
    pub fn for_base(base_path: PathBuf) -> Result<Self, ConfigError> {
        ProjectConfig::default().into_run_config(base_path, &Overrides::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel < 1 {
            return Err(ConfigError::InvalidParallelism(self.max_parallel));
        }
        for (name, value) in [
            ("probe timeout", self.probe_timeout),
            ("step timeout", self.step_timeout),
            ("poll interval", self.poll_interval),
            ("silence fallback", self.silence_fallback),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroTimeout { name });
            }
        }
        // A quiet period shorter than one poll passes on any output at all.
        if self.silence_fallback < self.poll_interval {
            return Err(ConfigError::SilenceBelowPoll {
                silence: self.silence_fallback,
                poll: self.poll_interval,
            });
        }
        if !TERMINALS.contains(&self.terminal.as_str()) {
            return Err(ConfigError::UnknownTerminal(self.terminal.clone()));
        }
        if self.agent.program.trim().is_empty() {
            return Err(ConfigError::EmptyProgram);
        }
        if let Some(stage) = &self.stage {
            stages::compile(stage)?;
        }
        self.exclude_set()?;
        Ok(())
    }

    pub fn exclude_set(&self) -> Result<ExcludeSet, ConfigError> {
        ExcludeSet::new(&self.exclude_patterns, self.include_hidden)
    }

    pub fn payload_resolver(&self) -> PayloadResolver {
        PayloadResolver::new(
            self.base_path.clone(),
            self.fallback_dir.clone(),
            self.stage.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = ProjectConfig::default();
        assert_eq!(config.defaults.max_parallel, 3);
        assert_eq!(config.defaults.terminal, "auto");
        assert_eq!(config.defaults.agent, "claude");
        assert!(config.defaults.stage.is_none());
        assert!(!config.defaults.include_hidden);
        assert_eq!(config.timeouts.probe_secs, 5);
        assert_eq!(config.timeouts.step_secs, 120);
        assert_eq!(config.timeouts.grace_secs, 10);
        assert_eq!(config.timeouts.silence_fallback_millis, 3000);
        assert_eq!(config.agent.program, "claude");
        assert_eq!(
            config.agent.resume_args,
            vec!["--resume", "--dangerously-skip-permissions"]
        );
        assert_eq!(config.agent.init_command, "/init");
        assert_eq!(config.agent.max_acknowledgements, 8);
        assert!(config.logging.execution_log);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[defaults]
max_parallel = 5
terminal = "pty"
stage = "scaffolding_mvp"
exclude = ["node_modules", "dist*"]
include_hidden = true
fallback_dir = "/opt/coderun/stages"

[timeouts]
probe_secs = 8
step_secs = 60
grace_secs = 3
silence_fallback_millis = 1500
poll_millis = 50

[agent]
program = "/usr/local/bin/claude"
fresh_args = []
init_command = "/init"
max_acknowledgements = 2

[agent.env]
CLAUDE_CONFIG_DIR = "/cfg"

[logging]
execution_log = false
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.defaults.max_parallel, 5);
        assert_eq!(config.defaults.terminal, "pty");
        assert_eq!(config.defaults.stage.as_deref(), Some("scaffolding_mvp"));
        assert_eq!(config.defaults.exclude, vec!["node_modules", "dist*"]);
        assert!(config.defaults.include_hidden);
        assert_eq!(
            config.defaults.fallback_dir.as_deref(),
            Some(Path::new("/opt/coderun/stages"))
        );
        assert_eq!(config.timeouts.probe_secs, 8);
        assert_eq!(config.timeouts.poll_millis, 50);
        assert_eq!(config.agent.program, "/usr/local/bin/claude");
        assert!(config.agent.fresh_args.is_empty());
        assert_eq!(config.agent.env.get("CLAUDE_CONFIG_DIR").unwrap(), "/cfg");
        assert_eq!(config.agent.max_acknowledgements, 2);
        assert!(!config.logging.execution_log);
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[timeouts]
probe_secs = 2
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.timeouts.probe_secs, 2);
        assert_eq!(config.timeouts.step_secs, 120);
        assert_eq!(config.defaults.max_parallel, 3);
        assert_eq!(config.agent.resume_selection, "\r");
    }

    #[test]
    fn load_walks_up_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let state = tmp.path().join(".coderun");
        fs::create_dir_all(&state).unwrap();
        fs::write(
            state.join("config.toml"),
            r#"
[defaults]
max_parallel = 2
"#,
        )
        .unwrap();

        let nested = tmp.path().join("projects").join("alpha");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = ProjectConfig::load(&nested).unwrap();
        assert_eq!(path, Some(state.join("config.toml")));
        assert_eq!(config.defaults.max_parallel, 2);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "[defaults]\nmax_parallel = \"many\"\n").unwrap();
        let err = ProjectConfig::load_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse"));
    }

    #[test]
    fn overrides_win_over_config() {
        let mut project = ProjectConfig::default();
        project.defaults.exclude = vec!["vendor".to_string()];
        project.defaults.stage = Some("document".to_string());

        let overrides = Overrides {
            max_parallel: Some(1),
            terminal: Some("tmux".to_string()),
            stage: Some("upgrade".to_string()),
            exclude: vec!["dist".to_string()],
            probe_timeout_secs: Some(9),
            no_log: true,
            ..Overrides::default()
        };
        let run = project
            .into_run_config(PathBuf::from("/work"), &overrides)
            .unwrap();
        assert_eq!(run.max_parallel, 1);
        assert_eq!(run.terminal, "tmux");
        assert_eq!(run.stage.as_deref(), Some("upgrade"));
        assert_eq!(run.exclude_patterns, vec!["vendor", "dist"]);
        assert_eq!(run.probe_timeout, Duration::from_secs(9));
        assert_eq!(run.step_timeout, Duration::from_secs(120));
        assert!(!run.execution_log);
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let overrides = Overrides {
            max_parallel: Some(0),
            ..Overrides::default()
        };
        let err = ProjectConfig::default()
            .into_run_config(PathBuf::from("/work"), &overrides)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParallelism(0)));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut project = ProjectConfig::default();
        project.timeouts.step_secs = 0;
        let err = project
            .into_run_config(PathBuf::from("/work"), &Overrides::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroTimeout { name: "step timeout" }));
    }

    #[test]
    fn zero_silence_fallback_is_rejected() {
        let mut project = ProjectConfig::default();
        project.timeouts.silence_fallback_millis = 0;
        let err = project
            .into_run_config(PathBuf::from("/work"), &Overrides::default())
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ZeroTimeout {
                name: "silence fallback"
            }
        ));
    }

    #[test]
    fn silence_fallback_must_cover_a_poll() {
        let mut project = ProjectConfig::default();
        project.timeouts.poll_millis = 500;
        project.timeouts.silence_fallback_millis = 200;
        let err = project
            .clone()
            .into_run_config(PathBuf::from("/work"), &Overrides::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::SilenceBelowPoll { .. }));
        assert_eq!(
            err.to_string(),
            "silence fallback (200ms) must be at least the poll interval (500ms)"
        );

        project.timeouts.silence_fallback_millis = 500;
        assert!(
            project
                .into_run_config(PathBuf::from("/work"), &Overrides::default())
                .is_ok()
        );
    }

    #[test]
    fn unknown_terminal_is_rejected() {
        let overrides = Overrides {
            terminal: Some("iterm".to_string()),
            ..Overrides::default()
        };
        let err = ProjectConfig::default()
            .into_run_config(PathBuf::from("/work"), &overrides)
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTerminal(_)));
    }

    #[test]
    fn bad_patterns_are_rejected() {
        let overrides = Overrides {
            exclude: vec!["[oops".to_string()],
            ..Overrides::default()
        };
        let err = ProjectConfig::default()
            .into_run_config(PathBuf::from("/work"), &overrides)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));

        let overrides = Overrides {
            stage: Some("[oops".to_string()),
            ..Overrides::default()
        };
        let err = ProjectConfig::default()
            .into_run_config(PathBuf::from("/work"), &overrides)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidStage { .. }));
    }

    #[test]
    fn empty_program_is_rejected() {
        let mut project = ProjectConfig::default();
        project.agent.program = "  ".to_string();
        let err = project
            .into_run_config(PathBuf::from("/work"), &Overrides::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyProgram));
    }

    #[test]
    fn renders_as_toml() {
        let text = ProjectConfig::default().to_toml().unwrap();
        assert!(text.contains("[defaults]"));
        assert!(text.contains("max_parallel = 3"));
        let parsed: ProjectConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, ProjectConfig::default());
    }
}
