//! Frame extraction for Blunder
//!
//! A [`Processor`] turns a [`CapturedError`] into the [`ErrorRecord`] that is
//! attached to a notice: a type, a message and an ordered list of frames.
//!
//! Extraction is best effort. A processor never fails; when nothing useful can
//! be recovered it returns an empty backtrace and the notice is still sent.

pub mod stack;

use crate::notice::{ErrorRecord, Frame};
use backtrace::Backtrace;
use async_trait::async_trait;
use std::any::Any;

pub use self::stack::{BacktraceProcessor, StackParseError, parse_stack_text};

/// Processor trait - extracts type, message and frames from a raw error
///
/// # Example
///
/// ```ignore
/// struct MessageOnly;
///
/// #[async_trait]
/// impl Processor for MessageOnly {
///     fn name(&self) -> &'static str { "message-only" }
///
///     async fn process(&self, error: &CapturedError) -> ErrorRecord {
///         ErrorRecord::new(error.kind(), error.message_or_display())
///     }
/// }
/// ```
#[async_trait]
pub trait Processor: Send + Sync {
    /// Processor name for logging
    fn name(&self) -> &'static str;

    /// Build the error record. Must not block the caller on slow work.
    async fn process(&self, error: &CapturedError) -> ErrorRecord;
}

/// Native stack representation carried by an error
#[derive(Debug, Clone)]
pub enum Stack {
    /// Captured in this process, resolved lazily by the processor
    Captured(Backtrace),
    /// Textual trace, e.g. from `std::backtrace::Backtrace` or a foreign host
    Text(String),
}

/// Single source locator for errors without a stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub function: Option<String>,
}

impl Location {
    pub fn to_frame(&self) -> Frame {
        Frame::new(
            self.function.clone().unwrap_or_default(),
            self.file.clone(),
            self.line,
            self.column,
        )
    }
}

/// A fault as it was raised, before normalization
///
/// # Example
///
/// ```
/// use blunder::CapturedError;
///
/// let parse_err = "x1".parse::<u32>().unwrap_err();
/// let captured = CapturedError::from(parse_err);
/// assert_eq!(captured.kind(), "ParseIntError");
/// assert_eq!(captured.message_or_display(), "invalid digit found in string");
/// ```
#[derive(Debug, Clone, Default)]
pub struct CapturedError {
    /// Type name, becomes `ErrorRecord::kind`
    pub name: Option<String>,
    /// Explicit message
    pub message: Option<String>,
    /// String form used when there is no explicit message
    pub display: String,
    pub stack: Option<Stack>,
    pub location: Option<Location>,
    /// Stack captured where `notify` was called, used when nothing else is known
    pub fallback: Option<Backtrace>,
    /// Skip frame extraction entirely
    pub no_stack: bool,
}

impl CapturedError {
    /// Capture a standard error. The type name becomes the error type.
    pub fn new<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let text = err.to_string();
        Self {
            name: Some(short_type_name(std::any::type_name::<E>()).to_string()),
            message: Some(text.clone()),
            display: text,
            ..Self::default()
        }
    }

    /// Capture a plain message with no type
    pub fn msg(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            display: message.clone(),
            message: Some(message),
            ..Self::default()
        }
    }

    /// Capture a panic payload as delivered to a panic hook or `catch_unwind`
    pub fn from_panic(
        payload: &(dyn Any + Send),
        location: Option<&std::panic::Location<'_>>,
    ) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            Some((*s).to_string())
        } else {
            payload.downcast_ref::<String>().cloned()
        };

        Self {
            name: Some("panic".to_string()),
            display: message.clone().unwrap_or_else(|| "Box<dyn Any>".to_string()),
            message,
            location: location.map(|loc| Location {
                file: loc.file().to_string(),
                line: loc.line(),
                column: loc.column(),
                function: None,
            }),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach an already captured backtrace
    pub fn with_backtrace(mut self, backtrace: Backtrace) -> Self {
        self.stack = Some(Stack::Captured(backtrace));
        self
    }

    /// Capture the current stack, resolved later by the processor
    pub fn with_current_backtrace(self) -> Self {
        self.with_backtrace(Backtrace::new_unresolved())
    }

    /// Attach a textual stack trace
    pub fn with_stack_text(mut self, text: impl Into<String>) -> Self {
        self.stack = Some(Stack::Text(text.into()));
        self
    }

    pub fn with_location(mut self, file: impl Into<String>, line: u32, column: u32) -> Self {
        self.location = Some(Location {
            file: file.into(),
            line,
            column,
            function: None,
        });
        self
    }

    /// Declare the error frame-pointer free: no backtrace will be extracted
    pub fn without_stack(mut self) -> Self {
        self.no_stack = true;
        self
    }

    /// Type name or empty string
    pub fn kind(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// Explicit message, or the string form when there is none
    pub fn message_or_display(&self) -> &str {
        match self.message.as_deref() {
            Some(m) if !m.is_empty() => m,
            _ => &self.display,
        }
    }

    /// Nothing to report: no type, text, stack or location
    pub fn is_empty(&self) -> bool {
        self.kind().is_empty()
            && self.message_or_display().is_empty()
            && self.stack.is_none()
            && self.location.is_none()
    }

    pub(crate) fn needs_fallback(&self) -> bool {
        !self.no_stack && self.stack.is_none() && self.location.is_none() && self.fallback.is_none()
    }

    /// Record the caller's stack for errors that carry none
    #[inline(never)]
    pub(crate) fn capture_fallback(&mut self) {
        self.fallback = Some(Backtrace::new_unresolved());
    }
}

impl<E> From<E> for CapturedError
where
    E: std::error::Error,
{
    fn from(err: E) -> Self {
        CapturedError::new(&err)
    }
}

/// Last path segment of a type name, without generics
fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    let base = base.trim_start_matches("dyn ");
    let base = base.split(" +").next().unwrap_or(base);
    base.rsplit("::").next().unwrap_or(base).trim()
}
