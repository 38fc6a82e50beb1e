use std::path::{Path, PathBuf};

/// Per-project and per-unit state directory name.
pub const STATE_DIR: &str = ".coderun";

/// Resolve the state directory for a base or unit directory.
pub fn state_dir(base: &Path) -> PathBuf {
    base.join(STATE_DIR)
}

/// Directory holding JSONL execution logs for runs over `base`.
pub fn log_dir(base: &Path) -> PathBuf {
    state_dir(base).join("logs")
}

/// Ordered directories searched for instruction payload files.
///
/// Order is unit directory, its parent, the base directory, then the
/// configured fallback directory. Duplicates (a unit directly under the base
/// has the base as its parent) are dropped, keeping the first occurrence.
pub fn payload_search_dirs(unit: &Path, base: &Path, fallback: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::with_capacity(4);
    let mut push = |p: &Path| {
        if !dirs.iter().any(|existing| existing == p) {
            dirs.push(p.to_path_buf());
        }
    };

    push(unit);
    if let Some(parent) = unit.parent() {
        push(parent);
    }
    push(base);
    if let Some(fallback) = fallback {
        push(fallback);
    }
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_order_is_unit_parent_base_fallback() {
        let dirs = payload_search_dirs(
            Path::new("/work/group/alpha"),
            Path::new("/work"),
            Some(Path::new("/opt/stages")),
        );
        assert_eq!(
            dirs,
            vec![
                PathBuf::from("/work/group/alpha"),
                PathBuf::from("/work/group"),
                PathBuf::from("/work"),
                PathBuf::from("/opt/stages"),
            ]
        );
    }

    #[test]
    fn parent_equal_to_base_is_not_repeated() {
        let dirs = payload_search_dirs(Path::new("/work/alpha"), Path::new("/work"), None);
        assert_eq!(
            dirs,
            vec![PathBuf::from("/work/alpha"), PathBuf::from("/work")]
        );
    }

    #[test]
    fn log_dir_lives_under_state_dir() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(
            log_dir(tmp.path()),
            tmp.path().join(".coderun").join("logs")
        );
    }
}
