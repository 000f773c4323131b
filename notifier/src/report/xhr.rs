//! Blocking HTTP reporter ("legacy-xhr")
//!
//! Drives `reqwest::blocking` on the Tokio blocking pool. Each delivery builds
//! and drops its own client inside the blocking task, never on a runtime
//! worker thread.

use crate::error::NotifyError;
use crate::notice::Notice;
use crate::report::{
    RETRY_DELAY_HEADER, RateLimiter, RawResponse, Reporter, ReporterKind, ReporterOptions,
    interpret_response,
};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

pub struct XhrReporter {
    limiter: Arc<RateLimiter>,
}

impl XhrReporter {
    /// Create a reporter on the shared xhr rate-limit window
    pub fn new() -> Self {
        Self {
            limiter: RateLimiter::shared(ReporterKind::Xhr),
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

impl Default for XhrReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn send_blocking(url: &str, timeout: Duration, payload: Vec<u8>) -> Result<RawResponse, String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| e.to_string())?;

    let response = client
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .body(payload)
        .send()
        .map_err(|e| e.to_string())?;

    let status = response.status().as_u16();
    let retry_delay = response
        .headers()
        .get(RETRY_DELAY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().map_err(|e| e.to_string())?;

    Ok(RawResponse {
        status,
        retry_delay,
        body,
    })
}

#[async_trait]
impl Reporter for XhrReporter {
    fn name(&self) -> &'static str {
        "xhr"
    }

    async fn report(&self, notice: Notice, opts: &ReporterOptions) -> Result<Notice, NotifyError> {
        if self.limiter.is_limited() {
            return Err(NotifyError::RateLimited);
        }

        let url = opts.url();
        let timeout = opts.timeout;
        let payload =
            serde_json::to_vec(&notice).map_err(|e| NotifyError::Transport(e.to_string()))?;

        let response = tokio::task::spawn_blocking(move || send_blocking(&url, timeout, payload))
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?
            .map_err(|e| {
                error!(host = %opts.host, error = %e, "xhr: request failed");
                NotifyError::Transport(e)
            })?;

        debug!(host = %opts.host, status = response.status, "xhr: collector responded");

        interpret_response(self.name(), response, notice, &self.limiter)
    }
}
