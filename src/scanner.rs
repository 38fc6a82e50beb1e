//! Work unit discovery.
//!
//! Lists the immediate child directories of a base path and marks the ones
//! excluded by name pattern or by the hidden-entry rule. Traversal is
//! read-only and non-recursive.

use std::path::{Path, PathBuf};

use glob::Pattern;
use serde::Serialize;
use tracing::debug;

use crate::error::{ConfigError, ScanError};

/// Entries whose name starts with this marker are hidden.
const HIDDEN_MARKER: char = '.';

/// One target directory processed as an independent task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkUnit {
    pub path: PathBuf,
    pub label: String,
    pub excluded: bool,
}

impl WorkUnit {
    pub fn new(path: PathBuf) -> Self {
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            path,
            label,
            excluded: false,
        }
    }
}

/// Name-based exclusion rules.
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    patterns: Vec<Pattern>,
    include_hidden: bool,
}

impl ExcludeSet {
    /// Compile exclusion entries. Plain names match only themselves; `*`,
    /// `?` and `[...]` behave like shell globs.
    pub fn new<S: AsRef<str>>(entries: &[S], include_hidden: bool) -> Result<Self, ConfigError> {
        let mut patterns = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            let pattern = Pattern::new(entry).map_err(|source| ConfigError::InvalidPattern {
                pattern: entry.to_string(),
                source,
            })?;
            patterns.push(pattern);
        }
        Ok(Self {
            patterns,
            include_hidden,
        })
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        if !self.include_hidden && name.starts_with(HIDDEN_MARKER) {
            return true;
        }
        self.patterns.iter().any(|p| p.matches(name))
    }
}

/// Every immediate child directory of `base`, sorted by name, with its
/// `excluded` flag set.
pub fn scan_all(base: &Path, excludes: &ExcludeSet) -> Result<Vec<WorkUnit>, ScanError> {
    if !base.exists() {
        return Err(ScanError::Missing(base.to_path_buf()));
    }
    if !base.is_dir() {
        return Err(ScanError::NotADirectory(base.to_path_buf()));
    }
    let base = base.canonicalize().map_err(|source| ScanError::Io {
        path: base.to_path_buf(),
        source,
    })?;

    let entries = std::fs::read_dir(&base).map_err(|source| ScanError::Io {
        path: base.clone(),
        source,
    })?;

    let mut units = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ScanError::Io {
            path: base.clone(),
            source,
        })?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let mut unit = WorkUnit::new(path);
        unit.excluded = excludes.is_excluded(&unit.label);
        units.push(unit);
    }

    units.sort_by(|a, b| a.label.cmp(&b.label));
    debug!(base = %base.display(), found = units.len(), "scanned base directory");
    Ok(units)
}

/// The eligible work units under `base`, in lexicographic order.
pub fn scan(base: &Path, excludes: &ExcludeSet) -> Result<Vec<WorkUnit>, ScanError> {
    Ok(scan_all(base, excludes)?
        .into_iter()
        .filter(|unit| !unit.excluded)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;

    fn labels(units: &[WorkUnit]) -> Vec<&str> {
        units.iter().map(|u| u.label.as_str()).collect()
    }

    #[test]
    fn hidden_entries_are_skipped_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        for name in [".git", "alpha", "beta"] {
            fs::create_dir(tmp.path().join(name)).unwrap();
        }

        let units = scan(tmp.path(), &ExcludeSet::default()).unwrap();
        assert_eq!(labels(&units), vec!["alpha", "beta"]);
        assert!(units.iter().all(|u| u.path.is_absolute()));
    }

    #[test]
    fn files_are_not_units() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("alpha")).unwrap();
        fs::write(tmp.path().join("coderun.md"), "main").unwrap();

        let units = scan(tmp.path(), &ExcludeSet::default()).unwrap();
        assert_eq!(labels(&units), vec!["alpha"]);
    }

    #[test]
    fn order_is_lexicographic() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["zeta", "Alpha", "beta", "alpha"] {
            fs::create_dir(tmp.path().join(name)).unwrap();
        }

        let units = scan(tmp.path(), &ExcludeSet::default()).unwrap();
        assert_eq!(labels(&units), vec!["Alpha", "alpha", "beta", "zeta"]);
    }

    #[test]
    fn exclude_names_and_globs() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["alpha", "node_modules", "dist", "dist-old", "beta"] {
            fs::create_dir(tmp.path().join(name)).unwrap();
        }

        let excludes = ExcludeSet::new(&["node_modules", "dist*"], false).unwrap();
        let units = scan(tmp.path(), &excludes).unwrap();
        assert_eq!(labels(&units), vec!["alpha", "beta"]);
    }

    #[test]
    fn scan_all_marks_excluded_units() {
        let tmp = tempfile::tempdir().unwrap();
        for name in [".cache", "alpha", "vendor"] {
            fs::create_dir(tmp.path().join(name)).unwrap();
        }

        let excludes = ExcludeSet::new(&["vendor"], false).unwrap();
        let units = scan_all(tmp.path(), &excludes).unwrap();
        let flags: Vec<(&str, bool)> = units
            .iter()
            .map(|u| (u.label.as_str(), u.excluded))
            .collect();
        assert_eq!(
            flags,
            vec![(".cache", true), ("alpha", false), ("vendor", true)]
        );
    }

    #[test]
    fn include_hidden_keeps_dot_directories() {
        let tmp = tempfile::tempdir().unwrap();
        for name in [".hidden", "alpha"] {
            fs::create_dir(tmp.path().join(name)).unwrap();
        }

        let excludes = ExcludeSet::new::<&str>(&[], true).unwrap();
        let units = scan(tmp.path(), &excludes).unwrap();
        assert_eq!(labels(&units), vec![".hidden", "alpha"]);
    }

    #[test]
    fn missing_base_is_scan_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = scan(&tmp.path().join("nope"), &ExcludeSet::default()).unwrap_err();
        assert!(matches!(err, ScanError::Missing(_)));
    }

    #[test]
    fn file_base_is_scan_error() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("file.txt");
        fs::write(&file, "x").unwrap();
        let err = scan(&file, &ExcludeSet::default()).unwrap_err();
        assert!(matches!(err, ScanError::NotADirectory(_)));
    }

    #[test]
    fn invalid_pattern_is_config_error() {
        let err = ExcludeSet::new(&["[unclosed"], false).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    proptest! {
        #[test]
        fn hidden_entries_never_become_units(
            names in proptest::collection::btree_set("\\.?[a-z]{1,8}", 1..12)
        ) {
            let tmp = tempfile::tempdir().unwrap();
            for name in &names {
                fs::create_dir(tmp.path().join(name)).unwrap();
            }

            let units = scan(tmp.path(), &ExcludeSet::default()).unwrap();
            prop_assert!(units.iter().all(|u| !u.label.starts_with('.')));

            let visible = names.iter().filter(|n| !n.starts_with('.')).count();
            prop_assert_eq!(units.len(), visible);
        }
    }
}
