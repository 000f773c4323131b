//! Client - the notification pipeline
//!
//! A [`Client`] owns the per-project state (options, filters, reporters,
//! offline buffer) and drives every notification through it:
//!
//! ```text
//! notify ──► validate ──► window check ──► offline? ──► OfflineBuffer
//!                                              │
//!                                              ▼ (spawned)
//!             default context ──► Processor ──► FilterChain ──► Reporters (all)
//!                                                   │                │
//!                                         None: Filtered     first settlement wins
//! ```
//!
//! Everything after the offline check runs on the Tokio runtime the client
//! was created in, so `notify` never blocks and can be called from any thread.
//!
//! # Example
//!
//! ```ignore
//! let client = Client::new(Options::new("17", "project-key"))?;
//! let outcome = client.notify(CapturedError::msg("disk full")).await;
//! ```

use crate::config::{Options, User};
use crate::deferred::{Deferred, Outcome};
use crate::error::{BlunderError, NotifyError, Result};
use crate::filter::{
    DebounceFilter, EnvironmentFilter, Filter, FilterChain, FrameworkMessageFilter, Host,
    IgnoreFilter, UncaughtMessageFilter,
};
use crate::historian::{Breadcrumb, Historian, UncaughtHandler};
use crate::metrics;
use crate::notice::{ErrorRecord, Fields, Notice};
use crate::offline::OfflineBuffer;
use crate::processor::{BacktraceProcessor, CapturedError, Processor};
use crate::report::{Reporter, ReporterKind, ReporterOptions, ReporterSpec};
use crate::wrap::{Arg, Callable, Wrapped};
use futures::FutureExt;
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::{Value, json};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Name reported in `context.notifier.name`
pub const NOTIFIER_NAME: &str = "blunder-rs";

/// Input to [`Client::notify`]
///
/// A bare error converts with `From`; the other fields are merged into the
/// notice on top of the client defaults.
#[derive(Debug, Default)]
pub struct Notification {
    pub error: Option<CapturedError>,
    pub context: Fields,
    pub params: Fields,
    pub session: Fields,
    pub environment: Fields,
    /// Handle to settle instead of a fresh one
    pub deferred: Option<Deferred>,
}

impl Notification {
    /// Notification for any standard error
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        CapturedError::new(err).into()
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_session(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.session.insert(key.into(), value.into());
        self
    }

    pub fn with_environment(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_deferred(mut self, deferred: Deferred) -> Self {
        self.deferred = Some(deferred);
        self
    }
}

impl From<CapturedError> for Notification {
    fn from(error: CapturedError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

impl From<Option<CapturedError>> for Notification {
    fn from(error: Option<CapturedError>) -> Self {
        Self {
            error,
            ..Self::default()
        }
    }
}

/// Error reporting client
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    this: Weak<ClientInner>,
    options: RwLock<Options>,
    processor: Arc<dyn Processor>,
    filters: FilterChain,
    reporters: RwLock<Vec<Arc<dyn Reporter>>>,
    offline: OfflineBuffer,
    is_offline: AtomicBool,
    historian: Arc<Historian>,
    runtime: Handle,
}

impl Client {
    /// Create a client with its own historian
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(options: Options) -> Result<Self> {
        Self::with_historian(options, Historian::new())
    }

    /// Create a client sharing `historian` with other clients
    pub fn with_historian(options: Options, historian: Arc<Historian>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            BlunderError::Runtime("blunder client must be created inside a Tokio runtime".into())
        })?;

        let processor = options
            .processor
            .clone()
            .unwrap_or_else(|| Arc::new(BacktraceProcessor::new()));

        let filters = FilterChain::new();
        filters.add(IgnoreFilter);
        filters.add(DebounceFilter::new(options.debounce));
        filters.add(UncaughtMessageFilter);
        filters.add(FrameworkMessageFilter);
        filters.add(EnvironmentFilter::new(Host::detect(options.page.clone())));

        let reporter = options
            .reporter
            .clone()
            .unwrap_or_else(|| ReporterKind::detect(&options.host).into())
            .build()?;

        info!(
            project_id = %options.project_id,
            host = %options.host,
            reporter = reporter.name(),
            processor = processor.name(),
            "blunder client created"
        );

        let offline = OfflineBuffer::new(options.offline_capacity);
        let inner = Arc::new_cyclic(|this| ClientInner {
            this: this.clone(),
            options: RwLock::new(options),
            processor,
            filters,
            reporters: RwLock::new(vec![reporter]),
            offline,
            is_offline: AtomicBool::new(false),
            historian: Arc::clone(&historian),
            runtime,
        });

        let handler: Weak<ClientInner> = Arc::downgrade(&inner);
        historian.register(handler);

        Ok(Self { inner })
    }

    /// Snapshot of the current options
    pub fn options(&self) -> Options {
        self.inner.options.read().clone()
    }

    pub fn set_project(&self, project_id: impl Into<String>, project_key: impl Into<String>) {
        let mut options = self.inner.options.write();
        options.project_id = project_id.into();
        options.project_key = project_key.into();
    }

    pub fn set_host(&self, host: impl Into<String>) {
        self.inner.options.write().host = host.into();
    }

    pub fn set_component(&self, component: impl Into<String>) {
        self.inner.options.write().component = Some(component.into());
    }

    pub fn set_environment(&self, environment: impl Into<String>) {
        self.inner.options.write().environment = environment.into();
    }

    pub fn user(&self) -> Option<User> {
        self.inner.options.read().user.clone()
    }

    pub fn set_user(&self, user: User) {
        self.inner.options.write().user = Some(user);
    }

    pub fn set_user_id(&self, id: impl Into<String>) {
        self.inner.options.write().user.get_or_insert_default().id = Some(id.into());
    }

    pub fn set_user_email(&self, email: impl Into<String>) {
        self.inner.options.write().user.get_or_insert_default().email = Some(email.into());
    }

    pub fn set_user_name(&self, name: impl Into<String>) {
        self.inner.options.write().user.get_or_insert_default().name = Some(name.into());
    }

    /// Add a reporter by kind, name or custom implementation
    ///
    /// Every reporter receives every notice that survives the filters.
    pub fn add_reporter(&self, reporter: impl Into<ReporterSpec>) -> Result<()> {
        let reporter = reporter.into().build()?;
        debug!(reporter = reporter.name(), "reporter added");
        self.inner.reporters.write().push(reporter);
        Ok(())
    }

    /// Append a filter after the built-ins and earlier custom filters
    pub fn add_filter<F: Filter + 'static>(&self, filter: F) {
        self.inner.filters.add(filter);
    }

    /// Names of the installed filters, in order
    pub fn filter_names(&self) -> Vec<&'static str> {
        self.inner.filters.names()
    }

    /// Report an error
    ///
    /// Validation, the window-error check and offline buffering happen
    /// before this returns; delivery runs in the background.
    pub fn notify(&self, notification: impl Into<Notification>) -> Deferred {
        self.inner.notify(notification.into())
    }

    /// Wrap a callable so its panics are reported, then resumed
    ///
    /// Wrapping an already wrapped callable returns it unchanged.
    pub fn wrap(&self, callable: Arc<dyn Callable>) -> Arc<dyn Callable> {
        if callable.is_wrapped() {
            return callable;
        }
        Arc::new(Wrapped::new(self.clone(), callable))
    }

    /// Wrap a closure
    pub fn wrap_fn<F>(&self, f: F) -> Arc<dyn Callable>
    where
        F: Fn(Vec<Arg>) -> Value + Send + Sync + 'static,
    {
        self.wrap(Arc::new(f))
    }

    /// Wrap `callable` and invoke it with `args`
    pub fn call(&self, callable: Arc<dyn Callable>, args: Vec<Arg>) -> Value {
        self.wrap(callable).call(args)
    }

    /// Start forwarding process-level panics to this client's historian
    pub fn onerror(&self) {
        self.inner.historian.install_panic_hook();
    }

    /// Connectivity restored: replay buffered notifications in order
    pub fn set_online(&self) {
        self.inner.is_offline.store(false, Ordering::SeqCst);

        let entries = self.inner.offline.drain();
        if entries.is_empty() {
            return;
        }

        info!(count = entries.len(), "back online, replaying buffered notifications");
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            for entry in entries {
                if let Some((error, notification)) =
                    inner.prepare(entry.notification, &entry.deferred)
                {
                    Arc::clone(&inner)
                        .deliver(error, notification, entry.deferred)
                        .await;
                }
            }
        });
    }

    /// Connectivity lost: buffer new notifications until [`Client::set_online`]
    pub fn set_offline(&self) {
        if !self.inner.is_offline.swap(true, Ordering::SeqCst) {
            info!("offline, buffering notifications");
        }
    }

    pub fn is_offline(&self) -> bool {
        self.inner.is_offline.load(Ordering::SeqCst)
    }

    /// Notifications waiting for connectivity
    pub fn offline_len(&self) -> usize {
        self.inner.offline.len()
    }

    pub fn add_breadcrumb(&self, breadcrumb: Breadcrumb) {
        self.inner.historian.add_breadcrumb(breadcrumb);
    }

    pub fn historian(&self) -> &Arc<Historian> {
        &self.inner.historian
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("options", &*self.inner.options.read())
            .field("filters", &self.inner.filters.names())
            .field("reporters", &self.inner.reporters.read().len())
            .field("offline", &self.is_offline())
            .finish()
    }
}

impl ClientInner {
    fn notify(self: &Arc<Self>, mut notification: Notification) -> Deferred {
        let deferred = match notification.deferred.take() {
            Some(deferred) => deferred,
            None => {
                let deferred = Deferred::new();
                deferred.on_settled(|outcome| metrics::try_record_notice(outcome_label(outcome)));
                deferred
            }
        };

        if let Some((error, notification)) = self.prepare(notification, &deferred) {
            let inner = Arc::clone(self);
            let pending = deferred.clone();
            self.runtime
                .spawn(async move { inner.deliver(error, notification, pending).await });
        }
        deferred
    }

    /// Synchronous part of `notify`
    ///
    /// Returns the error to deliver, or `None` when the notification was
    /// settled or parked in the offline buffer.
    fn prepare(
        &self,
        mut notification: Notification,
        deferred: &Deferred,
    ) -> Option<(CapturedError, Notification)> {
        let mut error = match notification.error.take() {
            Some(error) if !error.is_empty() => error,
            other => {
                let got = if other.is_some() { "\"\"" } else { "null" };
                deferred.reject(NotifyError::Validation(got.to_string()));
                return None;
            }
        };

        let window_error = notification
            .context
            .get("windowError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if window_error && self.options.read().ignore_window_error {
            debug!(error = error.message_or_display(), "window error ignored by configuration");
            deferred.reject(NotifyError::SuppressedByConfig);
            return None;
        }

        if error.needs_fallback() {
            error.capture_fallback();
        }

        if self.is_offline.load(Ordering::SeqCst) {
            notification.error = Some(error);
            self.offline.push(notification, deferred.clone());
            debug!(buffered = self.offline.len(), "offline, notification buffered");
            return None;
        }

        Some((error, notification))
    }

    async fn deliver(self: Arc<Self>, error: CapturedError, notification: Notification, deferred: Deferred) {
        let options = self.options.read().clone();

        let mut notice = Notice::new();
        notice.context = self.default_context(&options);
        notice.context.extend(notification.context);
        notice.params = notification.params;
        notice.session = notification.session;
        notice.environment = notification.environment;

        let record = match AssertUnwindSafe(self.processor.process(&error))
            .catch_unwind()
            .await
        {
            Ok(record) => record,
            Err(_) => {
                warn!(processor = self.processor.name(), "frame extraction panicked");
                ErrorRecord::new(error.kind(), error.message_or_display())
            }
        };
        notice.errors.push(record);

        let Some(notice) = self.filters.apply(notice).await else {
            deferred.reject(NotifyError::Filtered);
            return;
        };

        let reporters = self.reporters.read().clone();
        if reporters.is_empty() {
            warn!("no reporters configured");
            deferred.reject(NotifyError::Transport("no reporters configured".into()));
            return;
        }

        let reporter_options = ReporterOptions {
            project_id: options.project_id,
            project_key: options.project_key,
            host: options.host,
            timeout: options.timeout,
        };

        let deliveries = reporters.iter().map(|reporter| {
            let notice = notice.clone();
            let reporter_options = &reporter_options;
            let deferred = deferred.clone();
            async move {
                let result = reporter.report(notice, reporter_options).await;
                match &result {
                    Ok(notice) => {
                        metrics::try_record_response(reporter.name(), "ok");
                        debug!(reporter = reporter.name(), id = %notice.id, "notice delivered");
                    }
                    Err(e @ (NotifyError::Transport(_) | NotifyError::UnexpectedResponse { .. })) => {
                        metrics::try_record_response(reporter.name(), e.kind());
                        error!(reporter = reporter.name(), error = %e, "notice delivery failed");
                    }
                    Err(e) => {
                        metrics::try_record_response(reporter.name(), e.kind());
                        warn!(reporter = reporter.name(), error = %e, "notice rejected");
                    }
                }
                deferred.settle(result);
            }
        });
        join_all(deliveries).await;
    }

    fn default_context(&self, options: &Options) -> Fields {
        let mut context = Fields::new();
        context.insert("language".into(), "Rust".into());
        context.insert("severity".into(), "error".into());
        if let Some(component) = &options.component {
            context.insert("component".into(), component.clone().into());
        }
        context.insert("environment".into(), options.environment.clone().into());
        context.insert(
            "notifier".into(),
            json!({
                "name": NOTIFIER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            }),
        );
        if let Some(user) = &options.user
            && let Ok(user) = serde_json::to_value(user)
        {
            context.insert("user".into(), user);
        }
        if let Some(history) = self.historian.history_value() {
            context.insert("history".into(), history);
        }
        context
    }
}

impl UncaughtHandler for ClientInner {
    fn notify_uncaught(&self, error: CapturedError) {
        if let Some(this) = self.this.upgrade() {
            this.notify(Notification::from(error).with_context("windowError", true));
        }
    }
}

fn outcome_label(outcome: &Outcome) -> &'static str {
    match outcome {
        Ok(_) => "delivered",
        Err(e) => e.kind(),
    }
}
