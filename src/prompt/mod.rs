//! Prompt patterns for interactive agent output.
//!
//! A [`PatternSet`] is an ordered list of `(tag, regex)` pairs. Order is
//! priority: when several patterns match the same text, the one listed first
//! wins regardless of where in the text it matched. This lets a set check
//! "error" before "ready".
//!
//! ## Claude Code
//!
//! Claude Code renders a full-screen TUI. The patterns target the text left
//! after ANSI stripping. The session picker opened by `claude --resume` lists
//! the most recently updated conversation first, so selecting the top entry
//! is a bare Enter.

use std::fmt;
use std::ops::Range;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

/// What a matched pattern means to the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptTag {
    /// The session picker listed at least one prior session.
    SessionList,
    /// The agent reported that there is nothing to resume.
    NoSessions,
    /// The agent asks for permission (tool use, bypass mode, ...).
    Permission,
    /// The agent asks a yes/no style confirmation.
    Confirmation,
    /// The main input prompt is idle and accepts input.
    Ready,
    /// The agent is processing input.
    Busy,
    /// The agent printed an error.
    Error,
}

impl PromptTag {
    /// Prompts answered with the fixed acknowledgement.
    pub fn needs_acknowledgement(self) -> bool {
        matches!(self, PromptTag::Permission | PromptTag::Confirmation)
    }
}

impl fmt::Display for PromptTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PromptTag::SessionList => "session-list",
            PromptTag::NoSessions => "no-sessions",
            PromptTag::Permission => "permission",
            PromptTag::Confirmation => "confirmation",
            PromptTag::Ready => "ready",
            PromptTag::Busy => "busy",
            PromptTag::Error => "error",
        };
        f.write_str(s)
    }
}

/// Readiness inferred from output going quiet. Used only when no pattern in
/// the set matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SilenceFallback {
    pub tag: PromptTag,
    pub after: Duration,
}

/// Ordered prompt patterns with an optional silence fallback.
#[derive(Debug, Clone)]
pub struct PatternSet {
    patterns: Vec<(PromptTag, Regex)>,
    fallback: Option<SilenceFallback>,
}

impl PatternSet {
    pub fn new(patterns: Vec<(PromptTag, Regex)>) -> Self {
        Self {
            patterns,
            fallback: None,
        }
    }

    /// Compile `(tag, pattern)` pairs, keeping their order.
    pub fn compile(entries: &[(PromptTag, &str)]) -> Result<Self, regex::Error> {
        let patterns = entries
            .iter()
            .map(|(tag, pattern)| Regex::new(pattern).map(|re| (*tag, re)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(patterns))
    }

    pub fn with_fallback(mut self, tag: PromptTag, after: Duration) -> Self {
        self.fallback = Some(SilenceFallback { tag, after });
        self
    }

    pub fn fallback(&self) -> Option<SilenceFallback> {
        self.fallback
    }

    pub fn tags(&self) -> impl Iterator<Item = PromptTag> + '_ {
        self.patterns.iter().map(|(tag, _)| *tag)
    }

    /// First pattern (by set order) that matches anywhere in `text`.
    pub fn find(&self, text: &str) -> Option<(PromptTag, Range<usize>)> {
        self.patterns
            .iter()
            .find_map(|(tag, re)| re.find(text).map(|m| (*tag, m.range())))
    }

    /// Session picker opened by `claude --resume`.
    pub fn claude_code_probe() -> Self {
        Self::new(vec![
            (
                PromptTag::NoSessions,
                constant(r"(?i)no (conversations|sessions) (found|to resume)"),
            ),
            (
                PromptTag::SessionList,
                constant(r"(?i)(select a (session|conversation)|resume (a )?(session|conversation)|search conversations)"),
            ),
            (
                PromptTag::Confirmation,
                constant(r"(?i)(do you trust the files|press enter to continue|\[y/n\])"),
            ),
            (
                PromptTag::Permission,
                constant(r"(?i)(bypass permissions mode|do you want to proceed\?|allow tool\b)"),
            ),
            (PromptTag::Error, constant(r"(?i)(command not found|^error:)")),
        ])
    }

    /// Readiness gate for the main input prompt.
    pub fn claude_code_ready(silence: Duration) -> Self {
        Self::new(vec![
            (
                PromptTag::Error,
                constant(r"(?im)(^\s*error:|api error|invalid api key|command not found)"),
            ),
            (
                PromptTag::Permission,
                constant(r"(?i)(bypass permissions mode|do you want to proceed\?|allow tool\b)"),
            ),
            (
                PromptTag::Confirmation,
                constant(r"(?i)(do you trust the files|press enter to continue|\[y/n\])"),
            ),
            (
                PromptTag::Ready,
                constant(r"(?im)(\?\s+for shortcuts|^\s*[>❯]\s*$)"),
            ),
        ])
        .with_fallback(PromptTag::Ready, silence)
    }

    /// Acknowledgement that the last input was taken.
    pub fn claude_code_ack(silence: Duration) -> Self {
        Self::new(vec![
            (
                PromptTag::Error,
                constant(r"(?im)(^\s*error:|api error|invalid api key)"),
            ),
            (PromptTag::Busy, constant(r"(?i)esc to interrupt")),
            (
                PromptTag::Ready,
                constant(r"(?im)(\?\s+for shortcuts|^\s*[>❯]\s*$)"),
            ),
        ])
        .with_fallback(PromptTag::Busy, silence)
    }
}

/// Compile a pattern literal from this module. Every literal is exercised by
/// the tests below.
fn constant(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap()
}

/// Strip ANSI escape sequences from terminal output.
pub fn strip_ansi(input: &str) -> String {
    // CSI sequences (ESC [ ... final byte), OSC sequences (ESC ] ... ST) and
    // simple two-byte escapes (ESC + one char).
    static ANSI_RE: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]").unwrap()
    });
    ANSI_RE.replace_all(input, "").to_string()
}

/// Longest unfinished escape sequence held back from one read to the next.
const MAX_PARTIAL_ESCAPE: usize = 256;

/// Split `input` before an escape sequence that is cut off at its end.
///
/// Returns the text that can be stripped now and the unfinished tail, which
/// belongs in front of the next read.
pub fn split_partial_escape(input: &str) -> (&str, &str) {
    // Lone ESC, CSI without its final byte, OSC without its terminator.
    static PARTIAL_RE: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
        Regex::new(r"\x1b(?:\[[0-9;?]*|\][^\x07\x1b]*\x1b?)?$").unwrap()
    });
    match PARTIAL_RE.find(input) {
        Some(m) if input.len() - m.start() <= MAX_PARTIAL_ESCAPE => input.split_at(m.start()),
        _ => (input, ""),
    }
}
