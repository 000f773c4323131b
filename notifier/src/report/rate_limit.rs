//! Collector-imposed rate-limit window
//!
//! A 429 with a positive retry delay opens a window; until it closes the
//! reporter rejects without network I/O. Lock-free: the reset time is one
//! atomic, stored as nanoseconds since the limiter was created.

use crate::report::ReporterKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

/// Reset window shared by the reporters that hold it
#[derive(Debug)]
pub struct RateLimiter {
    /// Nanos since `start` when the window closes, 0 = never opened
    reset_at: AtomicU64,
    start: Instant,
}

static SHARED_FETCH: LazyLock<Arc<RateLimiter>> = LazyLock::new(|| Arc::new(RateLimiter::new()));
static SHARED_XHR: LazyLock<Arc<RateLimiter>> = LazyLock::new(|| Arc::new(RateLimiter::new()));
static SHARED_NATIVE: LazyLock<Arc<RateLimiter>> = LazyLock::new(|| Arc::new(RateLimiter::new()));

impl RateLimiter {
    /// A private window, not shared with any other reporter
    pub fn new() -> Self {
        Self {
            reset_at: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    /// The process-wide window for a built-in reporter kind
    ///
    /// Every client using the same kind sees the same window.
    pub fn shared(kind: ReporterKind) -> Arc<RateLimiter> {
        match kind {
            ReporterKind::Fetch => Arc::clone(&SHARED_FETCH),
            ReporterKind::Xhr => Arc::clone(&SHARED_XHR),
            ReporterKind::Native => Arc::clone(&SHARED_NATIVE),
        }
    }

    /// True while the window is open
    pub fn is_limited(&self) -> bool {
        self.is_limited_at(Instant::now())
    }

    pub fn is_limited_at(&self, now: Instant) -> bool {
        self.remaining_at(now).is_some()
    }

    /// Time until the window closes, `None` when closed
    pub fn remaining(&self) -> Option<Duration> {
        self.remaining_at(Instant::now())
    }

    pub fn remaining_at(&self, now: Instant) -> Option<Duration> {
        let reset = self.reset_at.load(Ordering::Acquire);
        let now = self.nanos(now);
        (reset > now).then(|| Duration::from_nanos(reset - now))
    }

    /// Close delivery for `delay` from now
    pub fn hold_for(&self, delay: Duration) {
        self.hold_for_at(Instant::now(), delay);
    }

    pub fn hold_for_at(&self, now: Instant, delay: Duration) {
        let delay = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        let reset = self.nanos(now).saturating_add(delay).max(1);
        self.reset_at.store(reset, Ordering::Release);
    }

    /// Close the window immediately
    pub fn clear(&self) {
        self.reset_at.store(0, Ordering::Release);
    }

    fn nanos(&self, now: Instant) -> u64 {
        u64::try_from(now.saturating_duration_since(self.start).as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_window_closes_after_delay() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        assert!(!limiter.is_limited_at(now));

        limiter.hold_for_at(now, Duration::from_secs(5));
        assert!(limiter.is_limited_at(now));
        assert!(limiter.is_limited_at(now + Duration::from_millis(4999)));
        assert!(!limiter.is_limited_at(now + Duration::from_secs(5)));
        assert!(!limiter.is_limited_at(now + Duration::from_secs(6)));
    }

    #[test]
    fn test_remaining() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        limiter.hold_for_at(now, Duration::from_secs(5));
        assert_eq!(
            limiter.remaining_at(now + Duration::from_secs(2)),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_later_hold_replaces_earlier() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        limiter.hold_for_at(now, Duration::from_secs(60));
        limiter.hold_for_at(now, Duration::from_secs(1));
        assert!(!limiter.is_limited_at(now + Duration::from_secs(2)));
    }

    #[test]
    fn test_clear() {
        let limiter = RateLimiter::new();
        limiter.hold_for(Duration::from_secs(60));
        assert!(limiter.is_limited());
        limiter.clear();
        assert!(!limiter.is_limited());
    }

    #[test]
    fn test_shared_per_kind() {
        let a = RateLimiter::shared(ReporterKind::Xhr);
        let b = RateLimiter::shared(ReporterKind::Xhr);
        let c = RateLimiter::shared(ReporterKind::Fetch);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
