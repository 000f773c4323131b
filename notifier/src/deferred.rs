//! Resolve-once completion handle
//!
//! Every notification returns a [`Deferred`]. Several reporters race to settle
//! it; the first settlement wins and later attempts are ignored.
//!
//! Handlers attached with [`Deferred::on_settled`] before settlement are queued,
//! handlers attached afterwards run immediately. Tasks can also `.await` it.

use crate::error::NotifyError;
use crate::notice::Notice;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::sync::Notify;

/// Final result of a notification
pub type Outcome = Result<Notice, NotifyError>;

type Handler = Box<dyn FnOnce(&Outcome) + Send>;

/// Cloneable handle to a single pending outcome
///
/// # Example
///
/// ```
/// use blunder::{Deferred, Notice, NotifyError};
///
/// let deferred = Deferred::new();
/// assert!(deferred.resolve(Notice::new()));
/// assert!(!deferred.reject(NotifyError::Filtered));
/// assert!(futures::executor::block_on(deferred.wait()).is_ok());
/// ```
#[derive(Clone, Default)]
pub struct Deferred {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    outcome: Option<Outcome>,
    handlers: Vec<Handler>,
}

impl Deferred {
    /// Create a pending handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Settle successfully. Returns `false` if already settled.
    pub fn resolve(&self, notice: Notice) -> bool {
        self.settle(Ok(notice))
    }

    /// Settle with a failure. Returns `false` if already settled.
    pub fn reject(&self, err: NotifyError) -> bool {
        self.settle(Err(err))
    }

    /// Settle with an outcome. Only the first call has any effect.
    pub fn settle(&self, outcome: Outcome) -> bool {
        let handlers = {
            let mut state = self.shared.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.handlers)
        };

        for handler in handlers {
            handler(&outcome);
        }
        self.shared.notify.notify_waiters();
        true
    }

    /// Run `handler` once the outcome is known
    pub fn on_settled<F>(&self, handler: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        let settled = {
            let mut state = self.shared.state.lock();
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    state.handlers.push(Box::new(handler));
                    return;
                }
            }
        };
        handler(&settled);
    }

    pub fn is_settled(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    /// Current outcome without waiting
    pub fn outcome(&self) -> Option<Outcome> {
        self.shared.state.lock().outcome.clone()
    }

    /// Wait for the outcome
    pub async fn wait(&self) -> Outcome {
        loop {
            // Register before checking so a settle in between is not missed
            let notified = self.shared.notify.notified();
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    /// True when both handles point at the same outcome
    pub fn ptr_eq(&self, other: &Deferred) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl IntoFuture for Deferred {
    type Output = Outcome;
    type IntoFuture = BoxFuture<'static, Outcome>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Deferred")
            .field("outcome", &state.outcome)
            .field("pending_handlers", &state.handlers.len())
            .finish()
    }
}
