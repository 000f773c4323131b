//! Strips the AngularJS error wrapper
//!
//! `[$compile:nonassign] Expression 'x' is non-assignable` becomes type
//! `$compile:nonassign` with message `Expression 'x' is non-assignable`.

use crate::filter::Filter;
use crate::notice::Notice;
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static WRAPPED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\[(\$[^\]\s]+:[^\]\s]+)\]\s*(.*)$").expect("valid regex")
});

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameworkMessageFilter;

#[async_trait]
impl Filter for FrameworkMessageFilter {
    fn name(&self) -> &'static str {
        "framework-message"
    }

    async fn apply(&self, mut notice: Notice) -> Option<Notice> {
        if let Some(record) = notice.first_error_mut()
            && let Some(caps) = WRAPPED.captures(&record.message)
        {
            let (kind, message) = (caps[1].to_string(), caps[2].to_string());
            record.kind = kind;
            record.message = message;
        }
        Some(notice)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::notice::ErrorRecord;

    async fn apply(kind: &str, message: &str) -> ErrorRecord {
        let mut notice = Notice::new();
        notice.errors.push(ErrorRecord::new(kind, message));
        FrameworkMessageFilter
            .apply(notice)
            .await
            .unwrap()
            .errors
            .remove(0)
    }

    #[tokio::test]
    async fn test_wrapper_stripped() {
        let record = apply("Error", "[$compile:nonassign] Expression 'x' is non-assignable").await;
        assert_eq!(record.kind, "$compile:nonassign");
        assert_eq!(record.message, "Expression 'x' is non-assignable");
    }

    #[tokio::test]
    async fn test_plain_message_untouched() {
        let record = apply("Error", "[not a wrapper] text").await;
        assert_eq!(record.kind, "Error");
        assert_eq!(record.message, "[not a wrapper] text");
    }
}
