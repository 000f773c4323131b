//! Offline buffer
//!
//! Notifications raised while the client is offline are parked here in
//! arrival order and replayed when connectivity returns. In memory only:
//! entries are lost on process exit.
//!
//! When the buffer is full the oldest entry is evicted and its `Deferred` is
//! rejected with [`NotifyError::Evicted`], so no caller waits forever.

use crate::client::Notification;
use crate::deferred::Deferred;
use crate::error::NotifyError;
use crate::metrics;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::warn;

/// Default number of parked notifications
pub const DEFAULT_CAPACITY: usize = 100;

/// A notification waiting for connectivity
#[derive(Debug)]
pub struct OfflineEntry {
    pub notification: Notification,
    /// Handle returned to the caller, settled after replay
    pub deferred: Deferred,
    pub buffered_at: Instant,
}

/// Bounded FIFO owned by one client
#[derive(Debug)]
pub struct OfflineBuffer {
    entries: Mutex<VecDeque<OfflineEntry>>,
    capacity: usize,
    /// Metrics: total entries ever buffered
    total_buffered: AtomicU64,
    /// Metrics: entries evicted due to capacity
    total_evicted: AtomicU64,
}

impl OfflineBuffer {
    /// Create a buffer holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            total_buffered: AtomicU64::new(0),
            total_evicted: AtomicU64::new(0),
        }
    }

    /// Park a notification, evicting the oldest entry if full
    pub fn push(&self, notification: Notification, deferred: Deferred) {
        let evicted = {
            let mut queue = self.entries.lock();
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(OfflineEntry {
                notification,
                deferred,
                buffered_at: Instant::now(),
            });
            evicted
        };

        self.total_buffered.fetch_add(1, Ordering::Relaxed);

        match evicted {
            Some(entry) => {
                self.total_evicted.fetch_add(1, Ordering::Relaxed);
                metrics::try_record_evicted(1);
                warn!(
                    capacity = self.capacity,
                    waited_ms = entry.buffered_at.elapsed().as_millis() as u64,
                    "offline buffer full, dropping oldest notification"
                );
                // Settle outside the lock: handlers may call back into the client
                entry.deferred.reject(NotifyError::Evicted {
                    capacity: self.capacity,
                });
            }
            None => metrics::try_add_offline(1.0),
        }
    }

    /// Take every entry in enqueue order
    pub fn drain(&self) -> Vec<OfflineEntry> {
        let drained: Vec<_> = self.entries.lock().drain(..).collect();
        metrics::try_add_offline(-(drained.len() as f64));
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total entries ever buffered
    pub fn total_buffered(&self) -> u64 {
        self.total_buffered.load(Ordering::Relaxed)
    }

    /// Total entries evicted due to capacity
    pub fn total_evicted(&self) -> u64 {
        self.total_evicted.load(Ordering::Relaxed)
    }
}

impl Default for OfflineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
