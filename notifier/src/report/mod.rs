//! Reporters deliver notices to the collector
//!
//! Every reporter speaks the same protocol:
//!
//! ```text
//! POST {host}/api/v1/projects/{projectId}/problems?key={projectKey}
//! content-type: application/json
//!
//! {notice}
//! ```
//!
//! | Response                        | Outcome                                        |
//! |---------------------------------|------------------------------------------------|
//! | 401                             | `Unauthorized`                                 |
//! | 429                             | `RateLimited`, reset window moved by the delay |
//! | 2xx-4xx with `{"id": ...}`      | notice with `id` set                           |
//! | 2xx-4xx with `{"error": ...}`   | `Rejected(error)`                              |
//! | anything else                   | `UnexpectedResponse`                           |
//!
//! While a reporter's rate-limit window is open it rejects without touching
//! the network. Built-in reporters share one window per kind across clients.

mod fetch;
mod native;
mod rate_limit;
mod xhr;

pub use fetch::FetchReporter;
pub use native::NativeReporter;
pub use rate_limit::RateLimiter;
pub use xhr::XhrReporter;

use crate::error::{BlunderError, NotifyError};
use crate::notice::Notice;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Header carrying the collector's retry delay in seconds
pub const RETRY_DELAY_HEADER: &str = "X-RateLimit-Delay";

/// Connection settings handed to every delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReporterOptions {
    pub project_id: String,
    pub project_key: String,
    pub host: String,
    pub timeout: Duration,
}

impl ReporterOptions {
    /// Collector endpoint for this project
    pub fn url(&self) -> String {
        format!(
            "{}/api/v1/projects/{}/problems?key={}",
            self.host.trim_end_matches('/'),
            self.project_id,
            self.project_key
        )
    }
}

/// Reporter trait - one delivery attempt per call
///
/// # Example
///
/// ```ignore
/// struct Stdout;
///
/// #[async_trait]
/// impl Reporter for Stdout {
///     fn name(&self) -> &'static str { "stdout" }
///
///     async fn report(&self, mut notice: Notice, _: &ReporterOptions) -> Result<Notice, NotifyError> {
///         println!("{}", serde_json::to_string(&notice).unwrap_or_default());
///         notice.id = "local".into();
///         Ok(notice)
///     }
/// }
/// ```
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Reporter name for logging and metrics
    fn name(&self) -> &'static str;

    /// Deliver the notice. `Ok` carries the notice with its collector id.
    async fn report(&self, notice: Notice, opts: &ReporterOptions) -> Result<Notice, NotifyError>;
}

/// Built-in reporter implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReporterKind {
    /// Async HTTP client ("fetch-like")
    Fetch,
    /// Blocking HTTP client on the blocking pool ("legacy-xhr")
    Xhr,
    /// Bare HTTP/1.1 connection ("host-native")
    Native,
}

impl ReporterKind {
    pub fn name(&self) -> &'static str {
        match self {
            ReporterKind::Fetch => "fetch",
            ReporterKind::Xhr => "xhr",
            ReporterKind::Native => "node",
        }
    }

    /// Pick a reporter for the current host
    ///
    /// A current-thread runtime talking plain http gets the native reporter,
    /// everything else gets fetch.
    pub fn detect(host: &str) -> Self {
        let current_thread = tokio::runtime::Handle::try_current()
            .map(|h| h.runtime_flavor() == tokio::runtime::RuntimeFlavor::CurrentThread)
            .unwrap_or(false);

        if current_thread && host.starts_with("http://") {
            ReporterKind::Native
        } else {
            ReporterKind::Fetch
        }
    }

    /// Build the reporter with the process-wide rate limiter for this kind
    pub fn build(self) -> Result<Arc<dyn Reporter>, BlunderError> {
        Ok(match self {
            ReporterKind::Fetch => Arc::new(FetchReporter::new()?),
            ReporterKind::Xhr => Arc::new(XhrReporter::new()),
            ReporterKind::Native => Arc::new(NativeReporter::new()),
        })
    }
}

impl FromStr for ReporterKind {
    type Err = BlunderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fetch" | "fetch-like" => Ok(ReporterKind::Fetch),
            "xhr" | "legacy-xhr" => Ok(ReporterKind::Xhr),
            "node" | "host-native" => Ok(ReporterKind::Native),
            other => Err(BlunderError::Config(format!("unknown reporter '{other}'"))),
        }
    }
}

impl fmt::Display for ReporterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A reporter selected by name or supplied directly
#[derive(Clone)]
pub enum ReporterSpec {
    Named(ReporterKind),
    Custom(Arc<dyn Reporter>),
}

impl ReporterSpec {
    pub fn custom<R: Reporter + 'static>(reporter: R) -> Self {
        ReporterSpec::Custom(Arc::new(reporter))
    }

    pub fn build(self) -> Result<Arc<dyn Reporter>, BlunderError> {
        match self {
            ReporterSpec::Named(kind) => kind.build(),
            ReporterSpec::Custom(reporter) => Ok(reporter),
        }
    }
}

impl From<ReporterKind> for ReporterSpec {
    fn from(kind: ReporterKind) -> Self {
        ReporterSpec::Named(kind)
    }
}

impl From<Arc<dyn Reporter>> for ReporterSpec {
    fn from(reporter: Arc<dyn Reporter>) -> Self {
        ReporterSpec::Custom(reporter)
    }
}

impl FromStr for ReporterSpec {
    type Err = BlunderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(ReporterSpec::Named)
    }
}

impl fmt::Debug for ReporterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReporterSpec::Named(kind) => f.debug_tuple("Named").field(kind).finish(),
            ReporterSpec::Custom(r) => f.debug_tuple("Custom").field(&r.name()).finish(),
        }
    }
}

/// Boxed future returned by a [`ReporterFn`]
pub type ReportFuture = Pin<Box<dyn Future<Output = Result<Notice, NotifyError>> + Send>>;

/// Reporter built from an async closure
///
/// # Example
///
/// ```
/// use blunder::report::ReporterFn;
///
/// let reporter = ReporterFn::new(|mut notice, _opts| async move {
///     notice.id = "local".to_string();
///     Ok(notice)
/// });
/// # let _ = reporter;
/// ```
pub struct ReporterFn {
    report_fn: Arc<dyn Fn(Notice, ReporterOptions) -> ReportFuture + Send + Sync>,
}

impl ReporterFn {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Notice, ReporterOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Notice, NotifyError>> + Send + 'static,
    {
        Self {
            report_fn: Arc::new(move |notice, opts| Box::pin(f(notice, opts))),
        }
    }
}

#[async_trait]
impl Reporter for ReporterFn {
    fn name(&self) -> &'static str {
        "custom"
    }

    async fn report(&self, notice: Notice, opts: &ReporterOptions) -> Result<Notice, NotifyError> {
        (self.report_fn)(notice, opts.clone()).await
    }
}

/// What a reporter got back from the collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    /// Value of the retry-delay header, if any
    pub retry_delay: Option<String>,
    pub body: String,
}

/// Apply the collector protocol to a response
pub fn interpret_response(
    reporter: &'static str,
    response: RawResponse,
    mut notice: Notice,
    limiter: &RateLimiter,
) -> Result<Notice, NotifyError> {
    match response.status {
        401 => return Err(NotifyError::Unauthorized),
        429 => {
            let delay = response
                .retry_delay
                .as_deref()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .filter(|secs| *secs > 0);
            if let Some(secs) = delay {
                limiter.hold_for(Duration::from_secs(secs.unsigned_abs()));
                tracing::warn!(reporter, delay_secs = secs, "collector rate limited us");
            }
            return Err(NotifyError::RateLimited);
        }
        200..500 => {
            if let Ok(body) = serde_json::from_str::<Value>(&response.body) {
                match body.get("id") {
                    Some(Value::String(id)) if !id.is_empty() => {
                        notice.id = id.clone();
                        return Ok(notice);
                    }
                    Some(Value::Number(id)) => {
                        notice.id = id.to_string();
                        return Ok(notice);
                    }
                    _ => {}
                }
                if let Some(Value::String(error)) = body.get("error")
                    && !error.is_empty()
                {
                    return Err(NotifyError::Rejected(error.clone()));
                }
            }
        }
        _ => {}
    }

    Err(NotifyError::UnexpectedResponse {
        reporter,
        status: response.status,
        body: response.body.trim().to_string(),
    })
}
