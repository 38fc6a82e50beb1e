//! tmux CLI wrappers.
//!
//! Session lifecycle, output capture via pipe-pane and input via send-keys.
//! Used by the tmux terminal strategy; every unit gets its own detached
//! session so the user can attach to it after the run.

use std::path::Path;
use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

/// Prefix for sessions created by coderun.
pub const SESSION_PREFIX: &str = "coderun-";

/// Check that tmux is installed and reachable. Returns the version string.
pub fn check_tmux() -> Result<String> {
    let output = Command::new("tmux")
        .arg("-V")
        .output()
        .context("tmux not found (install it, e.g. `apt install tmux` or `brew install tmux`)")?;

    if !output.status.success() {
        bail!(
            "tmux -V failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!(version = %version, "tmux found");
    Ok(version)
}

/// Parse `tmux 3.3a` into `(3, 3)`.
pub fn parse_tmux_version(version_raw: &str) -> Option<(u32, u32)> {
    let ver = version_raw.trim().strip_prefix("tmux ")?;
    let ver = ver.strip_prefix("next-").unwrap_or(ver);
    let (major, rest) = ver.split_once('.')?;
    let minor: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if major.is_empty() || minor.is_empty() {
        return None;
    }
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// `new-session -e` (per-session environment) needs tmux 3.0.
pub fn supports_session_env(version_raw: &str) -> bool {
    matches!(parse_tmux_version(version_raw), Some((major, _)) if major >= 3)
}

fn run_tmux<I, S>(args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    Command::new("tmux")
        .args(args)
        .output()
        .context("failed to run tmux command")
}

fn run_checked<I, S>(what: &str, args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let output = run_tmux(args)?;
    if !output.status.success() {
        bail!(
            "tmux {what} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Convention for session names: `coderun-<label>`.
///
/// Characters tmux cannot take in a target are escaped as `_xx` per byte and
/// `_` itself as `__`, so distinct labels never share a session.
pub fn session_name(label: &str) -> String {
    let mut escaped = String::with_capacity(label.len());
    for c in label.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            escaped.push(c);
        } else if c == '_' {
            escaped.push_str("__");
        } else {
            let mut utf8 = [0u8; 4];
            for byte in c.encode_utf8(&mut utf8).bytes() {
                escaped.push_str(&format!("_{byte:02x}"));
            }
        }
    }
    format!("{SESSION_PREFIX}{escaped}")
}

/// Command a user runs to look at a unit's session.
pub fn attach_hint(session: &str) -> String {
    format!("tmux attach -t {session}")
}

pub fn session_exists(session: &str) -> bool {
    run_tmux(["has-session", "-t", session])
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Create a detached session running `program args...` in `work_dir`.
pub fn create_session(
    session: &str,
    program: &str,
    args: &[String],
    work_dir: &Path,
    env: &[(String, String)],
) -> Result<()> {
    if session_exists(session) {
        bail!(
            "tmux session '{session}' already exists (kill it with `tmux kill-session -t {session}`)"
        );
    }

    let mut cmd = Command::new("tmux");
    cmd.args(["new-session", "-d", "-s", session, "-c"]);
    cmd.arg(work_dir);
    cmd.args(["-x", "220", "-y", "50"]);
    for (key, val) in env {
        cmd.arg("-e").arg(format!("{key}={val}"));
    }
    cmd.arg(program);
    cmd.args(args);

    let output = cmd
        .output()
        .with_context(|| format!("failed to create tmux session '{session}'"))?;
    if !output.status.success() {
        bail!(
            "tmux new-session failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    info!(session, work_dir = %work_dir.display(), "tmux session created");
    Ok(())
}

/// Stream all pane output into `log_path` (`pipe-pane "cat >> <log>"`).
pub fn setup_pipe_pane(target: &str, log_path: &Path) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
    }

    let pipe_cmd = format!("cat >> '{}'", log_path.display());
    run_checked("pipe-pane", ["pipe-pane", "-t", target, pipe_cmd.as_str()])?;
    debug!(target, log = %log_path.display(), "pipe-pane configured");
    Ok(())
}

/// Stop output capture; the pane keeps running.
pub fn stop_pipe_pane(target: &str) -> Result<()> {
    run_checked("pipe-pane", ["pipe-pane", "-t", target])
}

/// Send `text` literally, optionally followed by Enter.
pub fn send_keys(target: &str, text: &str, press_enter: bool) -> Result<()> {
    if !text.is_empty() {
        // `-l` keeps punctuation from being read as key names.
        run_checked("send-keys", ["send-keys", "-t", target, "-l", "--", text])
            .with_context(|| format!("failed to send keys to '{target}'"))?;
    }
    if press_enter {
        run_checked("send-keys Enter", ["send-keys", "-t", target, "C-m"])
            .with_context(|| format!("failed to send Enter to '{target}'"))?;
    }
    debug!(target, len = text.len(), press_enter, "sent keys");
    Ok(())
}

/// Kill a session. Missing sessions are not an error.
pub fn kill_session(session: &str) -> Result<()> {
    if !session_exists(session) {
        return Ok(());
    }
    run_checked("kill-session", ["kill-session", "-t", session])
        .with_context(|| format!("failed to kill tmux session '{session}'"))?;
    info!(session, "tmux session killed");
    Ok(())
}

/// Text currently visible in the pane.
pub fn capture_pane(target: &str) -> Result<String> {
    let output = run_tmux(["capture-pane", "-t", target, "-p"])
        .with_context(|| format!("failed to capture pane '{target}'"))?;
    if !output.status.success() {
        bail!(
            "tmux capture-pane failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_name_convention() {
        assert_eq!(session_name("alpha"), "coderun-alpha");
        assert_eq!(session_name("api.v2"), "coderun-api_2ev2");
        assert_eq!(session_name("my project"), "coderun-my_20project");
        assert_eq!(session_name("a:b"), "coderun-a_3ab");
        assert_eq!(session_name("snake_case"), "coderun-snake__case");
        assert_eq!(session_name("caf\u{e9}"), "coderun-caf_c3_a9");
    }

    #[test]
    fn sibling_labels_get_distinct_sessions() {
        let labels = ["my.app", "my-app", "my_app", "my:app", "my_2eapp", "my app"];
        let names: std::collections::HashSet<_> =
            labels.iter().map(|l| session_name(l)).collect();
        assert_eq!(names.len(), labels.len());
        assert_ne!(session_name("my.app"), session_name("my-app"));
    }

    #[test]
    fn attach_hint_names_session() {
        assert_eq!(attach_hint("coderun-alpha"), "tmux attach -t coderun-alpha");
    }

    #[test]
    fn parse_tmux_version_supports_suffixes() {
        assert_eq!(parse_tmux_version("tmux 3.4"), Some((3, 4)));
        assert_eq!(parse_tmux_version("tmux 3.3a"), Some((3, 3)));
        assert_eq!(parse_tmux_version("tmux next-3.5"), Some((3, 5)));
        assert_eq!(parse_tmux_version("tmux 2.9"), Some((2, 9)));
        assert_eq!(parse_tmux_version("tmux unknown"), None);
        assert_eq!(parse_tmux_version("screen 4.0"), None);
    }

    #[test]
    fn session_env_needs_tmux_three() {
        assert!(supports_session_env("tmux 3.0a"));
        assert!(!supports_session_env("tmux 2.9"));
    }

    #[test]
    fn nonexistent_session_does_not_exist() {
        assert!(!session_exists("coderun-test-nonexistent-12345"));
    }

    #[test]
    fn kill_nonexistent_session_is_ok() {
        if check_tmux().is_err() {
            return;
        }
        kill_session("coderun-test-nonexistent-kill-99999").unwrap();
    }

    #[cfg(feature = "integration")]
    mod live {
        use super::super::*;
        use std::time::Duration;

        #[test]
        fn create_and_kill_session() {
            let session = "coderun-test-lifecycle";
            let _ = kill_session(session);

            create_session(session, "sleep", &["10".to_string()], Path::new("/tmp"), &[])
                .unwrap();
            assert!(session_exists(session));

            kill_session(session).unwrap();
            assert!(!session_exists(session));
        }

        #[test]
        fn duplicate_session_is_error() {
            let session = "coderun-test-dup";
            let _ = kill_session(session);

            create_session(session, "sleep", &["10".to_string()], Path::new("/tmp"), &[])
                .unwrap();
            let result =
                create_session(session, "sleep", &["10".to_string()], Path::new("/tmp"), &[]);
            assert!(result.unwrap_err().to_string().contains("already exists"));

            kill_session(session).unwrap();
        }

        #[test]
        fn pipe_pane_captures_sent_keys() {
            let session = "coderun-test-pipe";
            let _ = kill_session(session);

            let tmp = tempfile::tempdir().unwrap();
            let log_path = tmp.path().join("pane.log");

            create_session(session, "cat", &[], Path::new("/tmp"), &[]).unwrap();
            setup_pipe_pane(session, &log_path).unwrap();
            std::thread::sleep(Duration::from_millis(200));

            send_keys(session, "coderun ping", true).unwrap();

            let mut content = String::new();
            for _ in 0..10 {
                std::thread::sleep(Duration::from_millis(200));
                content = std::fs::read_to_string(&log_path).unwrap_or_default();
                if content.contains("coderun ping") {
                    break;
                }
            }

            stop_pipe_pane(session).unwrap();
            kill_session(session).unwrap();
            assert!(
                content.contains("coderun ping"),
                "expected injected text in pane log, got: {content:?}"
            );
        }

        #[test]
        fn capture_pane_returns_content() {
            let session = "coderun-test-capture";
            let _ = kill_session(session);

            create_session(
                session,
                "bash",
                &["-c".to_string(), "echo 'capture-test'; sleep 2".to_string()],
                Path::new("/tmp"),
                &[],
            )
            .unwrap();
            std::thread::sleep(Duration::from_millis(500));

            let content = capture_pane(session).unwrap();
            assert!(content.contains("capture-test"), "got: {content:?}");

            kill_session(session).unwrap();
        }
    }
}
