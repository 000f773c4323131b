//! Historian - correlates uncaught faults across clients
//!
//! One `Historian` is shared by every client that should see the same
//! uncaught faults. It:
//!
//! - forwards uncaught faults (panics via [`Historian::install_panic_hook`],
//!   or anything passed to [`Historian::on_uncaught`]) to every live client
//! - keeps a bounded breadcrumb history that clients attach to notices
//! - drops the next uncaught fault after a wrapped call has already reported
//!   it, unless the panic hook is installed and already skipped that panic
//!
//! Clients are held weakly; registration never keeps a client alive.
//!
//! ```text
//! panic ──► hook ──► Historian::on_uncaught ──┬─► client A.notify
//!                         │                   └─► client B.notify
//!                         └─ ignore_next set? drop once
//! ```

use crate::processor::CapturedError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber, debug};
use tracing_subscriber::layer::Context;

/// Default number of breadcrumbs kept
pub const DEFAULT_MAX_HISTORY: usize = 20;

/// Receiver of forwarded uncaught faults
pub trait UncaughtHandler: Send + Sync {
    fn notify_uncaught(&self, error: CapturedError);
}

thread_local! {
    static WRAP_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as inside a wrapped call until dropped
///
/// The panic hook runs before unwinding reaches the wrapper, so it consults
/// this marker to leave wrapped panics to the wrapper.
pub(crate) struct WrapScope(());

impl WrapScope {
    pub(crate) fn enter() -> Self {
        WRAP_DEPTH.with(|d| d.set(d.get() + 1));
        WrapScope(())
    }
}

impl Drop for WrapScope {
    fn drop(&mut self) {
        WRAP_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// True while the current thread is running a wrapped call
pub fn in_wrapped_call() -> bool {
    WRAP_DEPTH.with(|d| d.get() > 0)
}

/// One entry of the history attached to notices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breadcrumb {
    /// `log`, `navigation`, `event`, ...
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Unix time in milliseconds
    pub date: u64,
}

impl Breadcrumb {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let date = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self {
            kind: kind.into(),
            message: message.into(),
            level: None,
            target: None,
            date,
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = Some(level.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// Shared correlator, see the module docs
pub struct Historian {
    clients: Mutex<Vec<Weak<dyn UncaughtHandler>>>,
    history: Mutex<VecDeque<Breadcrumb>>,
    max_history: usize,
    ignore_next: AtomicBool,
    hook_installed: AtomicBool,
}

impl Historian {
    pub fn new() -> Arc<Self> {
        Self::with_max_history(DEFAULT_MAX_HISTORY)
    }

    /// Keep at most `max_history` breadcrumbs
    pub fn with_max_history(max_history: usize) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(max_history.min(64))),
            max_history,
            ignore_next: AtomicBool::new(false),
            hook_installed: AtomicBool::new(false),
        })
    }

    /// Register a receiver of uncaught faults. There is no unregistration;
    /// dropped receivers are pruned on the next forward.
    pub fn register(&self, handler: Weak<dyn UncaughtHandler>) {
        self.clients.lock().push(handler);
    }

    /// Number of registered receivers still alive
    pub fn live_clients(&self) -> usize {
        self.clients
            .lock()
            .iter()
            .filter(|c| c.strong_count() > 0)
            .count()
    }

    /// Drop the next uncaught fault instead of forwarding it
    pub fn ignore_next_uncaught(&self) {
        self.ignore_next.store(true, Ordering::SeqCst);
    }

    /// Whether [`install_panic_hook`](Self::install_panic_hook) has run
    pub fn panic_hook_installed(&self) -> bool {
        self.hook_installed.load(Ordering::SeqCst)
    }

    /// Forward an uncaught fault to every live client
    ///
    /// Returns the number of clients notified.
    pub fn on_uncaught(&self, error: CapturedError) -> usize {
        if self.ignore_next.swap(false, Ordering::SeqCst) {
            debug!(error = error.message_or_display(), "uncaught error already reported, skipping");
            return 0;
        }

        let live: Vec<Arc<dyn UncaughtHandler>> = {
            let mut clients = self.clients.lock();
            clients.retain(|c| c.strong_count() > 0);
            clients.iter().filter_map(Weak::upgrade).collect()
        };

        for client in &live {
            client.notify_uncaught(error.clone());
        }
        live.len()
    }

    /// Report panics as uncaught faults
    ///
    /// Chains to the previously installed hook. Panics raised inside a wrapped
    /// call are left to the wrapper, which gets the location and stack
    /// captured here. Installing twice is a no-op.
    pub fn install_panic_hook(self: &Arc<Self>) {
        if self.hook_installed.swap(true, Ordering::SeqCst) {
            return;
        }

        let historian = Arc::downgrade(self);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let error = || {
                CapturedError::from_panic(info.payload(), info.location()).with_current_backtrace()
            };
            if in_wrapped_call() {
                crate::wrap::stash_hook_capture(error());
            } else if let Some(historian) = historian.upgrade() {
                historian.on_uncaught(error());
            }
            previous(info);
        }));
    }

    /// Append a breadcrumb, dropping the oldest beyond the limit
    pub fn add_breadcrumb(&self, breadcrumb: Breadcrumb) {
        if self.max_history == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= self.max_history {
            history.pop_front();
        }
        history.push_back(breadcrumb);
    }

    /// Breadcrumbs, oldest first
    pub fn history(&self) -> Vec<Breadcrumb> {
        self.history.lock().iter().cloned().collect()
    }

    /// History as a JSON array, `None` when empty
    pub fn history_value(&self) -> Option<Value> {
        let history = self.history.lock();
        if history.is_empty() {
            return None;
        }
        serde_json::to_value(&*history).ok()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }
}

impl fmt::Debug for Historian {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Historian")
            .field("clients", &self.clients.lock().len())
            .field("history", &self.history.lock().len())
            .field("ignore_next", &self.ignore_next.load(Ordering::Relaxed))
            .finish()
    }
}

/// Records application log events as `log` breadcrumbs
///
/// Events from this crate are skipped.
///
/// ```ignore
/// use tracing_subscriber::{Registry, layer::SubscriberExt};
///
/// let subscriber = Registry::default()
///     .with(BreadcrumbLayer::new(client.historian()))
///     .with(tracing_subscriber::fmt::layer());
/// ```
#[derive(Clone, Debug)]
pub struct BreadcrumbLayer {
    historian: Arc<Historian>,
}

impl BreadcrumbLayer {
    pub fn new(historian: Arc<Historian>) -> Self {
        Self { historian }
    }
}

const OWN_TARGET: &str = "blunder";

impl<S> tracing_subscriber::Layer<S> for BreadcrumbLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if target == OWN_TARGET || target.starts_with("blunder::") {
            return;
        }

        struct MessageVisitor {
            message: String,
            fields: String,
        }

        impl Visit for MessageVisitor {
            fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
                use std::fmt::Write;
                if field.name() == "message" {
                    let _ = write!(self.message, "{value:?}");
                } else {
                    if !self.fields.is_empty() {
                        self.fields.push(' ');
                    }
                    let _ = write!(self.fields, "{}={:?}", field.name(), value);
                }
            }
        }

        let mut visitor = MessageVisitor {
            message: String::new(),
            fields: String::new(),
        };
        event.record(&mut visitor);

        let message = match (visitor.message.is_empty(), visitor.fields.is_empty()) {
            (_, true) => visitor.message,
            (true, false) => visitor.fields,
            (false, false) => format!("{} {}", visitor.message, visitor.fields),
        };

        self.historian.add_breadcrumb(
            Breadcrumb::new("log", message)
                .with_level(metadata.level().as_str())
                .with_target(target),
        );
    }
}
