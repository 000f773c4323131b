//! Filter chain for Blunder
//!
//! Filters rewrite a notice on its way to the reporters. Each filter can
//! modify the notice or veto delivery by returning `None`.
//!
//! # Order
//!
//! ```text
//! Notice ──► ignore ──► debounce ──► uncaught ──► framework ──► environment ──► custom... ──► Reporters
//!              │           │
//!              └───────────┴─► None: chain stops, Deferred rejects with Filtered
//! ```
//!
//! Built-ins are installed by the client at construction. Custom filters are
//! appended after them in registration order.
//!
//! # Example
//!
//! ```ignore
//! struct DropHealthChecks;
//!
//! #[async_trait]
//! impl Filter for DropHealthChecks {
//!     fn name(&self) -> &'static str { "drop-health-checks" }
//!
//!     async fn apply(&self, notice: Notice) -> Option<Notice> {
//!         let is_health = notice.context.get("route").and_then(|v| v.as_str()) == Some("/health");
//!         (!is_health).then_some(notice)
//!     }
//! }
//! ```

mod debounce;
mod environment;
mod framework_message;
mod ignore;
mod uncaught_message;

pub use debounce::{DEFAULT_WINDOW as DEFAULT_DEBOUNCE_WINDOW, DebounceFilter};
pub use environment::{EnvironmentFilter, Host, PageInfo};
pub use framework_message::FrameworkMessageFilter;
pub use ignore::IgnoreFilter;
pub use uncaught_message::UncaughtMessageFilter;

use crate::notice::Notice;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

/// Filter trait for notice processing
///
/// # Return Value
///
/// - `Some(notice)` - Continue with the (possibly modified) notice
/// - `None` - Veto delivery
#[async_trait]
pub trait Filter: Send + Sync {
    /// Filter name for identification and logging
    fn name(&self) -> &'static str;

    /// Rewrite or veto a notice
    async fn apply(&self, notice: Notice) -> Option<Notice>;
}

/// Ordered list of filters
///
/// Appending takes `&self` so a shared client can register filters at any
/// time. A run works on a snapshot of the list, so no lock is held while a
/// filter awaits.
#[derive(Default)]
pub struct FilterChain {
    filters: RwLock<Vec<Arc<dyn Filter>>>,
}

impl FilterChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter
    pub fn add<F: Filter + 'static>(&self, filter: F) {
        self.filters.write().push(Arc::new(filter));
    }

    /// Append an already shared filter
    pub fn add_arc(&self, filter: Arc<dyn Filter>) {
        self.filters.write().push(filter);
    }

    /// Run the notice through every filter in order
    ///
    /// Returns `None` as soon as any filter vetoes.
    pub async fn apply(&self, mut notice: Notice) -> Option<Notice> {
        for filter in self.snapshot() {
            match filter.apply(notice).await {
                Some(next) => notice = next,
                None => {
                    tracing::debug!(filter = filter.name(), "notice vetoed");
                    return None;
                }
            }
        }
        Some(notice)
    }

    /// Names of the installed filters, in order
    pub fn names(&self) -> Vec<&'static str> {
        self.filters.read().iter().map(|f| f.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.read().len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Filter>> {
        self.filters.read().clone()
    }
}

/// Filter built from a closure
///
/// # Example
///
/// ```
/// use blunder::filter::{FilterChain, FilterFn};
///
/// let chain = FilterChain::new();
/// chain.add(FilterFn::new(|mut notice| {
///     notice.context.insert("release".into(), "1.4.2".into());
///     Some(notice)
/// }));
/// assert_eq!(chain.len(), 1);
/// ```
pub struct FilterFn<F>
where
    F: Fn(Notice) -> Option<Notice> + Send + Sync,
{
    filter_fn: F,
}

impl<F> FilterFn<F>
where
    F: Fn(Notice) -> Option<Notice> + Send + Sync,
{
    pub fn new(filter_fn: F) -> Self {
        Self { filter_fn }
    }
}

#[async_trait]
impl<F> Filter for FilterFn<F>
where
    F: Fn(Notice) -> Option<Notice> + Send + Sync,
{
    fn name(&self) -> &'static str {
        "custom"
    }

    async fn apply(&self, notice: Notice) -> Option<Notice> {
        (self.filter_fn)(notice)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::notice::ErrorRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn notice(message: &str) -> Notice {
        let mut notice = Notice::new();
        notice.errors.push(ErrorRecord::new("Error", message));
        notice
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let chain = FilterChain::new();
        chain.add(FilterFn::new(|mut n: Notice| {
            n.context.insert("step".into(), "one".into());
            Some(n)
        }));
        chain.add(FilterFn::new(|mut n: Notice| {
            let prev = n.context["step"].as_str().unwrap_or_default().to_string();
            n.context.insert("step".into(), format!("{prev},two").into());
            Some(n)
        }));

        let out = chain.apply(notice("boom")).await.expect("should pass");
        assert_eq!(out.context["step"], "one,two");
    }

    #[tokio::test]
    async fn test_veto_stops_chain() {
        let later = Arc::new(AtomicUsize::new(0));
        let chain = FilterChain::new();
        chain.add(FilterFn::new(|_| None));
        let l = Arc::clone(&later);
        chain.add(FilterFn::new(move |n| {
            l.fetch_add(1, Ordering::SeqCst);
            Some(n)
        }));

        assert!(chain.apply(notice("boom")).await.is_none());
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_chain_passes_through() {
        let chain = FilterChain::new();
        assert!(chain.is_empty());
        let out = chain.apply(notice("boom")).await.unwrap();
        assert_eq!(out.errors[0].message, "boom");
    }

    #[test]
    fn test_names() {
        let chain = FilterChain::new();
        chain.add(IgnoreFilter);
        chain.add(FilterFn::new(Some));
        assert_eq!(chain.names(), vec!["ignore", "custom"]);
    }
}
