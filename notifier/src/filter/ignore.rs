//! Drops notices that carry nothing actionable

use crate::filter::Filter;
use crate::notice::Notice;
use async_trait::async_trait;

/// Messages hosts emit when the real fault is hidden from us
const IGNORED_MESSAGES: &[&str] = &["Script error", "Script error.", "InvalidAccessError"];

/// Vetoes untyped errors whose message is a known opaque placeholder
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreFilter;

impl IgnoreFilter {
    pub fn is_ignored(notice: &Notice) -> bool {
        notice.first_error().is_some_and(|err| {
            err.kind.is_empty() && IGNORED_MESSAGES.contains(&err.message.as_str())
        })
    }
}

#[async_trait]
impl Filter for IgnoreFilter {
    fn name(&self) -> &'static str {
        "ignore"
    }

    async fn apply(&self, notice: Notice) -> Option<Notice> {
        if Self::is_ignored(&notice) {
            tracing::debug!("ignored opaque host error");
            return None;
        }
        Some(notice)
    }
}
