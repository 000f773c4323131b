//! Notice - the report sent to the collector
//!
//! A Notice is assembled by the client, rewritten by the filter chain and
//! serialized as the JSON body of the collector POST.
//!
//! ```text
//! CapturedError ──► Processor ──► ErrorRecord ─┐
//!                                              ▼
//!                    default context ──► Notice ──► Filters ──► Reporters
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON object used for context, params, session and environment
pub type Fields = Map<String, Value>;

/// One captured fault, normalized for the collector
///
/// # Example
///
/// ```
/// use blunder::notice::{ErrorRecord, Notice};
///
/// let mut notice = Notice::new();
/// notice.errors.push(ErrorRecord::new("TypeError", "x is undefined"));
/// assert!(notice.id.is_empty());
/// assert_eq!(notice.first_error().map(|e| e.kind.as_str()), Some("TypeError"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    /// Collector-assigned id, empty until a reporter succeeds
    #[serde(default)]
    pub id: String,

    /// Captured errors, outermost first
    pub errors: Vec<ErrorRecord>,

    #[serde(default)]
    pub context: Fields,

    #[serde(default)]
    pub params: Fields,

    #[serde(default)]
    pub session: Fields,

    #[serde(default)]
    pub environment: Fields,
}

impl Notice {
    /// Create an empty notice
    pub fn new() -> Self {
        Self::default()
    }

    /// The error that filters and fingerprints look at
    pub fn first_error(&self) -> Option<&ErrorRecord> {
        self.errors.first()
    }

    pub fn first_error_mut(&mut self) -> Option<&mut ErrorRecord> {
        self.errors.first_mut()
    }

    /// Set a context key, replacing any existing value
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Type, message and backtrace of one error
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub backtrace: Vec<Frame>,
}

impl ErrorRecord {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            backtrace: Vec::new(),
        }
    }

    /// Attach a backtrace
    pub fn with_backtrace(mut self, backtrace: Vec<Frame>) -> Self {
        self.backtrace = backtrace;
        self
    }

    /// Innermost frame, where the fault was raised
    pub fn top_frame(&self) -> Option<&Frame> {
        self.backtrace.first()
    }
}

/// One call frame. Unknown parts stay empty or zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub function: String,

    #[serde(default)]
    pub file: String,

    #[serde(default)]
    pub line: u32,

    #[serde(default)]
    pub column: u32,
}

impl Frame {
    pub fn new(function: impl Into<String>, file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            function: function.into(),
            file: file.into(),
            line,
            column,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_type_serialized_as_type() {
        let record = ErrorRecord::new("ParseIntError", "invalid digit")
            .with_backtrace(vec![Frame::new("main", "src/main.rs", 10, 5)]);

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "ParseIntError");
        assert_eq!(value["backtrace"][0]["line"], 10);
        assert!(value.get("kind").is_none());
    }

    #[test]
    fn test_notice_wire_shape() {
        let mut notice = Notice::new().with_context("severity", "error");
        notice.errors.push(ErrorRecord::new("", "boom"));

        let value = serde_json::to_value(&notice).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "",
                "errors": [{"type": "", "message": "boom", "backtrace": []}],
                "context": {"severity": "error"},
                "params": {},
                "session": {},
                "environment": {}
            })
        );
    }

    #[test]
    fn test_frame_defaults_when_fields_missing() {
        let frame: Frame = serde_json::from_value(json!({"function": "run"})).unwrap();
        assert_eq!(frame.file, "");
        assert_eq!(frame.line, 0);
        assert_eq!(frame.column, 0);
    }

    #[test]
    fn test_top_frame() {
        let record = ErrorRecord::new("E", "m").with_backtrace(vec![
            Frame::new("inner", "a.rs", 1, 1),
            Frame::new("outer", "b.rs", 2, 2),
        ]);
        assert_eq!(record.top_frame().unwrap().function, "inner");
    }
}
