//! Debounce filter
//!
//! Suppresses a notice whose fingerprint was already delivered within the
//! trailing window. A fault that recurs on every tick of a loop is reported
//! once per window instead of flooding the reporters.
//!
//! # Fingerprint
//!
//! Hash of the first error's type, message and top frame (function, file,
//! line, column). Two notices with the same fault at the same place collide;
//! the same message raised from a different frame does not.
//!
//! # Memory Behavior
//!
//! Expired fingerprints are pruned every `cleanup_interval` checks, so the
//! map may hold stale entries between prunes.

use crate::filter::Filter;
use crate::notice::Notice;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Default suppression window
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

const DEFAULT_CLEANUP_INTERVAL: u32 = 100;

/// Per-client time-windowed duplicate suppression
pub struct DebounceFilter {
    /// fingerprint -> last delivery time
    seen: Mutex<HashMap<u64, Instant>>,
    window: Duration,
    ops_since_cleanup: AtomicU32,
    cleanup_interval: u32,
}

impl DebounceFilter {
    pub fn new(window: Duration) -> Self {
        Self::with_cleanup_interval(window, DEFAULT_CLEANUP_INTERVAL)
    }

    /// Prune expired fingerprints every `cleanup_interval` checks (minimum 1)
    pub fn with_cleanup_interval(window: Duration, cleanup_interval: u32) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            window,
            ops_since_cleanup: AtomicU32::new(0),
            cleanup_interval: cleanup_interval.max(1),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Fingerprint of the notice's first error, `None` when it has no errors
    pub fn fingerprint(notice: &Notice) -> Option<u64> {
        let err = notice.first_error()?;
        let mut hasher = DefaultHasher::new();
        err.kind.hash(&mut hasher);
        err.message.hash(&mut hasher);
        err.top_frame().hash(&mut hasher);
        Some(hasher.finish())
    }

    /// Returns true if the fingerprint should be delivered now
    pub fn check(&self, fingerprint: u64) -> bool {
        let now = Instant::now();

        let ops = self.ops_since_cleanup.fetch_add(1, Ordering::Relaxed);
        if ops >= self.cleanup_interval {
            self.ops_since_cleanup.store(0, Ordering::Relaxed);
            self.cleanup(now);
        }

        let mut seen = self.seen.lock();
        if let Some(last) = seen.get(&fingerprint)
            && now.duration_since(*last) < self.window
        {
            return false;
        }

        seen.insert(fingerprint, now);
        true
    }

    fn cleanup(&self, now: Instant) {
        let window = self.window;
        self.seen
            .lock()
            .retain(|_, last| now.duration_since(*last) < window);
    }

    /// Number of tracked fingerprints
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

impl Default for DebounceFilter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[async_trait]
impl Filter for DebounceFilter {
    fn name(&self) -> &'static str {
        "debounce"
    }

    async fn apply(&self, notice: Notice) -> Option<Notice> {
        let Some(fingerprint) = Self::fingerprint(&notice) else {
            return Some(notice);
        };

        if self.check(fingerprint) {
            Some(notice)
        } else {
            tracing::debug!(fingerprint, "duplicate notice debounced");
            None
        }
    }
}
