//! Timed prompt expectation.
//!
//! [`PromptWaiter::wait`] reads from a channel until a pattern in the given
//! set matches, the set's silence fallback fires, the timeout expires, the
//! channel closes or the run is cancelled.
//!
//! ## Incremental scanning
//!
//! ```text
//! captured: [ .......... scanned .......... | new ]
//!                             ^ look-back   ^ scanned_upto
//! ```
//!
//! Each poll scans only the new text plus a short look-back window, so a
//! prompt split across two reads is still found and long outputs are never
//! rescanned from the start. The window is moved forward to a line start when
//! possible so `^` anchors only match real line starts.
//!
//! Text after a match is kept and offered first to the next wait.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::trace;

use crate::prompt::{PatternSet, PromptTag, split_partial_escape, strip_ansi};
use crate::scheduler::CancelToken;
use crate::terminal::{Channel, ChannelError};

/// Bytes of already-scanned text re-offered to every scan.
pub const DEFAULT_LOOKBACK: usize = 256;

/// A resolved wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMatch {
    pub tag: PromptTag,
    /// Text the pattern matched; empty when the silence fallback fired.
    pub matched_text: String,
    /// Everything this wait consumed, up to and including the match.
    pub captured: String,
}

impl PromptMatch {
    pub fn from_fallback(&self) -> bool {
        self.matched_text.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("no expected prompt within the timeout")]
    Timeout { captured: String },

    #[error("channel closed while waiting for a prompt")]
    Closed { captured: String },

    #[error("cancelled while waiting for a prompt")]
    Cancelled { captured: String },

    #[error("channel failed: {0}")]
    Channel(String),
}

impl WaitError {
    /// Output seen before the wait gave up.
    pub fn captured(&self) -> &str {
        match self {
            WaitError::Timeout { captured }
            | WaitError::Closed { captured }
            | WaitError::Cancelled { captured } => captured,
            WaitError::Channel(_) => "",
        }
    }
}

/// Per-unit waiter. Owns the unconsumed tail of the output stream.
#[derive(Debug)]
pub struct PromptWaiter {
    pending: String,
    /// Escape sequence cut off at the end of the last read.
    partial_escape: String,
    default_timeout: Duration,
    poll_interval: Duration,
    lookback: usize,
    cancel: CancelToken,
}

impl PromptWaiter {
    pub fn new(default_timeout: Duration, poll_interval: Duration, cancel: CancelToken) -> Self {
        Self {
            pending: String::new(),
            partial_escape: String::new(),
            default_timeout,
            poll_interval,
            lookback: DEFAULT_LOOKBACK,
            cancel,
        }
    }

    pub fn with_lookback(mut self, lookback: usize) -> Self {
        self.lookback = lookback;
        self
    }

    /// Drop unconsumed output, e.g. when switching to a new channel.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.partial_escape.clear();
    }

    /// Unconsumed text up to the next line break.
    pub fn rest_of_line(&self) -> &str {
        self.pending.lines().next().unwrap_or("")
    }

    /// Wait for one of `patterns` on `channel`.
    ///
    /// `timeout` defaults to the waiter's configured timeout.
    pub fn wait(
        &mut self,
        channel: &mut dyn Channel,
        patterns: &PatternSet,
        timeout: Option<Duration>,
    ) -> Result<PromptMatch, WaitError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let start = Instant::now();
        let mut buffer = std::mem::take(&mut self.pending);
        let mut seen_output = !buffer.is_empty();
        let mut scanned_upto = 0usize;
        let mut last_activity = start;

        loop {
            if scanned_upto < buffer.len() {
                let window = self.window_start(&buffer, scanned_upto);
                if let Some((tag, range)) = patterns.find(&buffer[window..]) {
                    let (from, to) = (window + range.start, window + range.end);
                    let matched_text = buffer[from..to].to_string();
                    self.pending = buffer.split_off(to);
                    trace!(%tag, matched = %matched_text, "prompt matched");
                    return Ok(PromptMatch {
                        tag,
                        matched_text,
                        captured: buffer,
                    });
                }
                scanned_upto = buffer.len();
            }

            if self.cancel.is_cancelled() {
                return Err(WaitError::Cancelled { captured: buffer });
            }

            let now = Instant::now();
            if let Some(fallback) = patterns.fallback()
                && seen_output
                && now.duration_since(last_activity) >= fallback.after
            {
                trace!(tag = %fallback.tag, "silence fallback");
                return Ok(PromptMatch {
                    tag: fallback.tag,
                    matched_text: String::new(),
                    captured: buffer,
                });
            }

            let elapsed = now.duration_since(start);
            if elapsed >= timeout {
                return Err(WaitError::Timeout { captured: buffer });
            }

            let slice = self.poll_interval.min(timeout - elapsed);
            match channel.read_available(slice) {
                Ok(chunk) if chunk.is_empty() => {}
                Ok(chunk) => {
                    let mut raw = std::mem::take(&mut self.partial_escape);
                    raw.push_str(&chunk);
                    let (complete, partial) = split_partial_escape(&raw);
                    let clean = strip_ansi(complete);
                    self.partial_escape = partial.to_string();
                    if !clean.is_empty() {
                        buffer.push_str(&clean);
                        seen_output = true;
                    }
                    last_activity = Instant::now();
                }
                Err(ChannelError::Closed) => return Err(WaitError::Closed { captured: buffer }),
                Err(e) => return Err(WaitError::Channel(e.to_string())),
            }
        }
    }

    /// Start of the scan window for text appended after `scanned_upto`.
    fn window_start(&self, buffer: &str, scanned_upto: usize) -> usize {
        if scanned_upto == 0 {
            return 0;
        }
        let cut = floor_char_boundary(buffer, scanned_upto.saturating_sub(self.lookback));
        match buffer[cut..scanned_upto].find('\n') {
            Some(nl) => cut + nl + 1,
            None => cut,
        }
    }
}

/// The last `max` bytes of `text`, for error reports.
pub fn tail(text: &str, max: usize) -> String {
    let mut start = text.len().saturating_sub(max);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
