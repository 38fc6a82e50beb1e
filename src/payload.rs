//! Instruction payload lookup.
//!
//! Two slots, `init` and `main`, are resolved per unit by walking the search
//! path from `paths::payload_search_dirs`; the first directory holding a
//! matching file wins. A stage pattern switches to stage-specific file names
//! and falls back to the generic names when no stage file exists.
//!
//! The stage marker is read here as well. It only decides whether the `init`
//! payload is delivered; session resumption is decided by the probe.

use std::fmt;
use std::path::{Path, PathBuf};

use glob::Pattern;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::UnitError;
use crate::paths;

const GENERIC_INIT: &str = "coderun_init.md";
const GENERIC_MAIN: &str = "coderun.md";

/// Named payload slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadSlot {
    Init,
    Main,
}

impl fmt::Display for PayloadSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadSlot::Init => write!(f, "init"),
            PayloadSlot::Main => write!(f, "main"),
        }
    }
}

/// One input delivered to the interactive session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    InitCommand,
    Init,
    Main,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::InitCommand => write!(f, "init command"),
            StepKind::Init => write!(f, "init payload"),
            StepKind::Main => write!(f, "main payload"),
        }
    }
}

/// Text read from an instruction file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionPayload {
    pub kind: PayloadSlot,
    pub content: String,
    pub source: PathBuf,
}

impl InstructionPayload {
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// Payloads and stage marker found for one unit.
#[derive(Debug, Clone, Default)]
pub struct ResolvedPayloads {
    pub init: Option<InstructionPayload>,
    pub main: Option<InstructionPayload>,
    /// Marker file that was found, if any.
    pub marker: Option<PathBuf>,
    pub searched: Vec<PathBuf>,
}

impl ResolvedPayloads {
    pub fn stage_complete(&self) -> bool {
        self.marker.is_some()
    }

    /// The `main` payload, or the error that fails the unit before any
    /// terminal is opened.
    pub fn require_main(&self) -> Result<&InstructionPayload, UnitError> {
        self.main.as_ref().ok_or_else(|| UnitError::PayloadMissing {
            slot: PayloadSlot::Main,
            searched: self.searched.clone(),
        })
    }
}

/// Locates payload files and stage markers for units of one run.
#[derive(Debug, Clone)]
pub struct PayloadResolver {
    base: PathBuf,
    fallback: Option<PathBuf>,
    stage: Option<String>,
}

impl PayloadResolver {
    pub fn new(base: PathBuf, fallback: Option<PathBuf>, stage: Option<String>) -> Self {
        Self {
            base,
            fallback,
            stage,
        }
    }

    pub fn stage(&self) -> Option<&str> {
        self.stage.as_deref()
    }

    fn slot_names(&self, slot: PayloadSlot) -> Vec<String> {
        let generic = match slot {
            PayloadSlot::Init => GENERIC_INIT,
            PayloadSlot::Main => GENERIC_MAIN,
        };
        match &self.stage {
            Some(stage) => {
                let staged = match slot {
                    PayloadSlot::Init => format!("coderun_init_{stage}.md"),
                    PayloadSlot::Main => format!("coderun_continue_{stage}.md"),
                };
                vec![staged, generic.to_string()]
            }
            None => vec![generic.to_string()],
        }
    }

    /// Path of the first file for `slot` on the search path, if any.
    pub fn locate(&self, slot: PayloadSlot, unit: &Path) -> Option<PathBuf> {
        let dirs = paths::payload_search_dirs(unit, &self.base, self.fallback.as_deref());
        self.slot_names(slot)
            .iter()
            .find_map(|name| dirs.iter().find_map(|dir| find_in_dir(dir, name)))
    }

    /// Marker file whose presence means the current stage already ran its
    /// initialization for this unit.
    pub fn marker(&self, unit: &Path) -> Option<PathBuf> {
        let name = match &self.stage {
            Some(stage) => format!("stage-{stage}.done"),
            None => "init.done".to_string(),
        };
        find_in_dir(&paths::state_dir(unit), &name)
    }

    pub fn resolve(&self, unit: &Path) -> Result<ResolvedPayloads, UnitError> {
        let searched = paths::payload_search_dirs(unit, &self.base, self.fallback.as_deref());
        let init = self.load(PayloadSlot::Init, unit)?;
        let main = self.load(PayloadSlot::Main, unit)?;
        let marker = self.marker(unit);
        debug!(
            unit = %unit.display(),
            init = ?init.as_ref().map(|p| &p.source),
            main = ?main.as_ref().map(|p| &p.source),
            marker = ?marker,
            "resolved payloads"
        );
        Ok(ResolvedPayloads {
            init,
            main,
            marker,
            searched,
        })
    }

    fn load(&self, slot: PayloadSlot, unit: &Path) -> Result<Option<InstructionPayload>, UnitError> {
        let Some(path) = self.locate(slot, unit) else {
            return Ok(None);
        };
        let content =
            std::fs::read_to_string(&path).map_err(|e| UnitError::PayloadUnreadable {
                slot,
                path: path.clone(),
                detail: e.to_string(),
            })?;
        if content.trim().is_empty() {
            warn!(path = %path.display(), "{slot} payload is empty");
        }
        Ok(Some(InstructionPayload {
            kind: slot,
            content,
            source: path,
        }))
    }
}

fn has_glob_meta(name: &str) -> bool {
    name.contains(['*', '?', '['])
}

fn find_in_dir(dir: &Path, name: &str) -> Option<PathBuf> {
    if !has_glob_meta(name) {
        let candidate = dir.join(name);
        return candidate.is_file().then_some(candidate);
    }

    let pattern = format!(
        "{}/{}",
        Pattern::escape(&dir.to_string_lossy()),
        name
    );
    let mut matches: Vec<PathBuf> = glob::glob(&pattern)
        .ok()?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();
    matches.sort();
    matches.into_iter().next()
}
