//! Default processor backed by the `backtrace` crate
//!
//! Resolution order:
//!
//! 1. The error's own stack (captured backtrace or textual trace)
//! 2. The error's single file/line locator
//! 3. The stack captured at the `notify` call site, minus the two frames that
//!    belong to the notifier itself
//!
//! Errors marked `no_stack` skip all of this and get an empty backtrace.

use super::{CapturedError, Processor, Stack};
use crate::notice::{ErrorRecord, Frame};
use async_trait::async_trait;
use backtrace::Backtrace;
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::warn;

/// Frames kept per error
const DEFAULT_MAX_FRAMES: usize = 64;

/// Crates whose frames are dropped from the top of a captured backtrace
const SKIPPED_INITIAL_CRATES: &[&str] = &[
    "backtrace",
    "blunder",
    "std",
    "core",
    "alloc",
    "rust_begin_unwind",
];

/// `  12: my_app::handler::run`
#[allow(clippy::expect_used)]
static NUMBERED_FRAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+:\s+(.+?)\s*$").expect("valid regex"));

/// `             at ./src/handler.rs:42:9`
#[allow(clippy::expect_used)]
static RUST_LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s+at\s+(.+?):(\d+)(?::(\d+))?\s*$").expect("valid regex"));

/// `    at render (https://example.com/app.js:10:15)`
#[allow(clippy::expect_used)]
static HOST_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*at\s+(?:(.+?)\s+\()?(\S+?):(\d+):(\d+)\)?\s*$").expect("valid regex")
});

/// Textual trace could not be understood
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StackParseError {
    #[error("no frames found in {lines} line(s) of stack text")]
    NoFrames { lines: usize },
}

/// Processor that resolves `backtrace` captures and parses textual traces
#[derive(Debug, Clone)]
pub struct BacktraceProcessor {
    max_frames: usize,
}

impl BacktraceProcessor {
    pub fn new() -> Self {
        Self {
            max_frames: DEFAULT_MAX_FRAMES,
        }
    }

    /// Keep at most `max_frames` frames per error
    pub fn max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    /// Synchronous extraction, run on the blocking pool by `process`
    pub fn extract(&self, error: &CapturedError) -> Vec<Frame> {
        if error.no_stack {
            return Vec::new();
        }

        let mut frames = match &error.stack {
            Some(Stack::Captured(bt)) => resolve_frames(bt.clone(), SKIPPED_INITIAL_CRATES),
            Some(Stack::Text(text)) => match parse_stack_text(text) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(error = %e, stack = %text, "failed to parse stack text");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        if frames.is_empty()
            && let Some(location) = &error.location
        {
            frames.push(location.to_frame());
        }

        if frames.is_empty()
            && let Some(fallback) = &error.fallback
        {
            frames = resolve_frames(fallback.clone(), SKIPPED_INITIAL_CRATES);
        }

        frames.truncate(self.max_frames);
        frames
    }
}

impl Default for BacktraceProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for BacktraceProcessor {
    fn name(&self) -> &'static str {
        "backtrace"
    }

    async fn process(&self, error: &CapturedError) -> ErrorRecord {
        let record = ErrorRecord::new(error.kind(), error.message_or_display());
        if error.no_stack {
            return record;
        }

        // Symbol resolution reads debug info from disk
        let processor = self.clone();
        let owned = error.clone();
        let frames = match tokio::task::spawn_blocking(move || processor.extract(&owned)).await {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "frame extraction failed, sending without backtrace");
                Vec::new()
            }
        };

        record.with_backtrace(frames)
    }
}

/// Resolve symbols and convert to frames, dropping leading frames from `skipped` crates
fn resolve_frames(mut backtrace: Backtrace, skipped: &[&str]) -> Vec<Frame> {
    backtrace.resolve();

    let mut frames = Vec::new();
    let mut leading = true;

    for frame in backtrace.frames() {
        for symbol in frame.symbols() {
            let function = symbol
                .name()
                .map(|name| format!("{name:#}"))
                .unwrap_or_default();

            if leading && skipped.contains(&crate_of(&function)) {
                continue;
            }
            leading = false;

            frames.push(Frame {
                function,
                file: symbol
                    .filename()
                    .map(|path| path.display().to_string())
                    .unwrap_or_default(),
                line: symbol.lineno().unwrap_or(0),
                column: symbol.colno().unwrap_or(0),
            });
        }
    }

    frames
}

/// First path segment of a demangled symbol, `<` of trait impls stripped
fn crate_of(function: &str) -> &str {
    let trimmed = function.trim_start_matches('<');
    trimmed.split("::").next().unwrap_or(trimmed)
}

/// Parse a textual stack trace into frames
///
/// Understands the Rust backtrace format (`N: function` followed by an
/// optional `at file:line:col` line) and the `at function (file:line:col)`
/// format used by browser and script hosts. Header and note lines are skipped.
pub fn parse_stack_text(text: &str) -> Result<Vec<Frame>, StackParseError> {
    let mut frames = Vec::new();
    let mut pending: Option<Frame> = None;
    let mut lines = 0;

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        lines += 1;

        if let Some(caps) = NUMBERED_FRAME.captures(line) {
            frames.extend(pending.take());
            pending = Some(Frame {
                function: caps[1].to_string(),
                ..Frame::default()
            });
            continue;
        }

        if let Some(frame) = pending.as_mut()
            && frame.file.is_empty()
            && let Some(caps) = RUST_LOCATION.captures(line)
        {
            frame.file = caps[1].to_string();
            frame.line = caps[2].parse().unwrap_or(0);
            frame.column = caps.get(3).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
            continue;
        }

        if let Some(caps) = HOST_FRAME.captures(line) {
            frames.extend(pending.take());
            frames.push(Frame {
                function: caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
                file: caps[2].to_string(),
                line: caps[3].parse().unwrap_or(0),
                column: caps[4].parse().unwrap_or(0),
            });
        }
    }
    frames.extend(pending);

    if frames.is_empty() && lines > 0 {
        return Err(StackParseError::NoFrames { lines });
    }
    Ok(frames)
}
