//! Bare HTTP/1.1 reporter ("host-native")
//!
//! Opens one `hyper` connection per delivery over a plain `TcpStream`. No TLS:
//! `https` hosts are refused before connecting.

use crate::error::NotifyError;
use crate::notice::Notice;
use crate::report::{
    RETRY_DELAY_HEADER, RateLimiter, RawResponse, Reporter, ReporterKind, ReporterOptions,
    interpret_response,
};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, Uri};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

pub struct NativeReporter {
    limiter: Arc<RateLimiter>,
}

impl NativeReporter {
    /// Create a reporter on the shared native rate-limit window
    pub fn new() -> Self {
        Self {
            limiter: RateLimiter::shared(ReporterKind::Native),
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

impl Default for NativeReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Socket address, `Host` header value and origin-form target of a URL
fn split_url(url: &str) -> Result<(String, String, String), NotifyError> {
    let uri: Uri = url
        .parse()
        .map_err(|e| NotifyError::Transport(format!("blunder: node: invalid url '{url}': {e}")))?;

    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => {
            return Err(NotifyError::Transport(format!(
                "blunder: node: scheme '{other}' is not supported"
            )));
        }
        None => {
            return Err(NotifyError::Transport(format!(
                "blunder: node: url '{url}' has no scheme"
            )));
        }
    }

    let host = uri
        .host()
        .ok_or_else(|| NotifyError::Transport(format!("blunder: node: url '{url}' has no host")))?;
    let port = uri.port_u16().unwrap_or(80);
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let authority = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .unwrap_or_else(|| host.to_string());

    Ok((format!("{host}:{port}"), authority, target))
}

async fn send(addr: String, authority: String, target: String, payload: Vec<u8>) -> Result<RawResponse, NotifyError> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(target)
        .header(HOST, authority)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(payload)))
        .map_err(|e| NotifyError::Transport(e.to_string()))?;

    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| NotifyError::Transport(e.to_string()))?;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = http1::handshake(io)
        .await
        .map_err(|e| NotifyError::Transport(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!(error = %e, "node: connection error");
        }
    });

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| NotifyError::Transport(e.to_string()))?;

    let status = response.status().as_u16();
    let retry_delay = response
        .headers()
        .get(RETRY_DELAY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let body = response
        .collect()
        .await
        .map_err(|e| NotifyError::Transport(e.to_string()))?
        .to_bytes();

    Ok(RawResponse {
        status,
        retry_delay,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

#[async_trait]
impl Reporter for NativeReporter {
    fn name(&self) -> &'static str {
        "node"
    }

    async fn report(&self, notice: Notice, opts: &ReporterOptions) -> Result<Notice, NotifyError> {
        if self.limiter.is_limited() {
            return Err(NotifyError::RateLimited);
        }

        let (addr, authority, target) = split_url(&opts.url())?;
        let payload =
            serde_json::to_vec(&notice).map_err(|e| NotifyError::Transport(e.to_string()))?;

        let response = tokio::time::timeout(opts.timeout, send(addr, authority, target, payload))
            .await
            .map_err(|_| {
                NotifyError::Transport(format!("blunder: node: timed out after {:?}", opts.timeout))
            })?
            .inspect_err(|e| error!(host = %opts.host, error = %e, "node: request failed"))?;

        debug!(host = %opts.host, status = response.status, "node: collector responded");

        interpret_response(self.name(), response, notice, &self.limiter)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_split_url() {
        let (addr, authority, target) =
            split_url("http://localhost:7850/api/v1/projects/1/problems?key=k").unwrap();
        assert_eq!(addr, "localhost:7850");
        assert_eq!(authority, "localhost:7850");
        assert_eq!(target, "/api/v1/projects/1/problems?key=k");
    }

    #[test]
    fn test_split_url_default_port() {
        let (addr, authority, _) = split_url("http://collector.internal/x").unwrap();
        assert_eq!(addr, "collector.internal:80");
        assert_eq!(authority, "collector.internal");
    }

    #[test]
    fn test_https_refused() {
        let err = split_url("https://collector.example.com/x").unwrap_err();
        assert!(matches!(err, NotifyError::Transport(msg) if msg.contains("https")));
    }
}
