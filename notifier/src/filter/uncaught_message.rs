//! Rewrites generic uncaught-error messages into typed ones
//!
//! Hosts often report a fault as a plain string with the real type folded into
//! the text. Pulling the type back out lets collectors group and filter on it.
//!
//! | Message                                                     | Type            | Message                |
//! |-------------------------------------------------------------|-----------------|------------------------|
//! | `Uncaught TypeError: x is undefined`                        | `TypeError`     | `x is undefined`       |
//! | ``called `Result::unwrap()` on an `Err` value: ParseIntError { .. }`` | `ParseIntError` | `ParseIntError { .. }` |
//! | ``called `Option::unwrap()` on a `None` value``             | `None`          | unchanged              |

use crate::filter::Filter;
use crate::notice::{ErrorRecord, Notice};
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;

/// Types that say nothing about the fault
const GENERIC_TYPES: &[&str] = &["", "Error", "panic"];

const OPTION_UNWRAP: &str = "called `Option::unwrap()` on a `None` value";

#[allow(clippy::expect_used)]
static UNCAUGHT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^Uncaught (\w+): (.*)$").expect("valid regex"));

#[allow(clippy::expect_used)]
static RESULT_UNWRAP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^called `Result::unwrap\(\)` on an `Err` value: (.*)$").expect("valid regex")
});

#[allow(clippy::expect_used)]
static LEADING_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Z][A-Za-z0-9_]*)").expect("valid regex"));

#[derive(Debug, Clone, Copy, Default)]
pub struct UncaughtMessageFilter;

impl UncaughtMessageFilter {
    /// Rewrite one record in place
    pub fn rewrite(record: &mut ErrorRecord) {
        if !GENERIC_TYPES.contains(&record.kind.as_str()) {
            return;
        }

        if let Some(caps) = UNCAUGHT.captures(&record.message) {
            let (kind, message) = (caps[1].to_string(), caps[2].to_string());
            record.kind = kind;
            record.message = message;
            return;
        }

        if let Some(caps) = RESULT_UNWRAP.captures(&record.message) {
            let value = caps[1].to_string();
            if let Some(ident) = LEADING_IDENT.captures(&value) {
                record.kind = ident[1].to_string();
            }
            record.message = value;
            return;
        }

        if record.message == OPTION_UNWRAP {
            record.kind = "None".to_string();
        }
    }
}

#[async_trait]
impl Filter for UncaughtMessageFilter {
    fn name(&self) -> &'static str {
        "uncaught-message"
    }

    async fn apply(&self, mut notice: Notice) -> Option<Notice> {
        if let Some(record) = notice.first_error_mut() {
            Self::rewrite(record);
        }
        Some(notice)
    }
}
