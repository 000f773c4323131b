//! Async HTTP reporter ("fetch-like")

use crate::error::{BlunderError, NotifyError};
use crate::notice::Notice;
use crate::report::{
    RETRY_DELAY_HEADER, RateLimiter, RawResponse, Reporter, ReporterKind, ReporterOptions,
    interpret_response,
};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Connection timeout; the request timeout comes from the options
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// POSTs notices with a pooled async `reqwest` client
///
/// # Example
///
/// ```ignore
/// let reporter = FetchReporter::new()?.with_rate_limiter(Arc::new(RateLimiter::new()));
/// client.add_reporter(ReporterSpec::custom(reporter))?;
/// ```
pub struct FetchReporter {
    client: Client,
    limiter: Arc<RateLimiter>,
}

impl FetchReporter {
    /// Create a reporter on the shared fetch rate-limit window
    ///
    /// # Errors
    /// Returns `BlunderError::Http` if the HTTP client cannot be created
    pub fn new() -> Result<Self, BlunderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            limiter: RateLimiter::shared(ReporterKind::Fetch),
        })
    }

    /// Use a different rate-limit window
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

#[async_trait]
impl Reporter for FetchReporter {
    fn name(&self) -> &'static str {
        "fetch"
    }

    async fn report(&self, notice: Notice, opts: &ReporterOptions) -> Result<Notice, NotifyError> {
        if self.limiter.is_limited() {
            return Err(NotifyError::RateLimited);
        }

        let url = opts.url();
        let payload =
            serde_json::to_vec(&notice).map_err(|e| NotifyError::Transport(e.to_string()))?;

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .timeout(opts.timeout)
            .body(payload)
            .send()
            .await
            .map_err(|e| {
                error!(host = %opts.host, error = %e, "fetch: request failed");
                NotifyError::Transport(e.to_string())
            })?;

        let status = response.status().as_u16();
        let retry_delay = response
            .headers()
            .get(RETRY_DELAY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        debug!(host = %opts.host, status, "fetch: collector responded");

        interpret_response(
            self.name(),
            RawResponse {
                status,
                retry_delay,
                body,
            },
            notice,
            &self.limiter,
        )
    }
}
