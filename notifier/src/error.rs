//! Error types for Blunder

use thiserror::Error;

/// Result type alias for Blunder setup operations
pub type Result<T> = std::result::Result<T, BlunderError>;

/// Errors raised while setting up a notifier
///
/// Delivery failures never show up here; they settle a [`Deferred`](crate::Deferred)
/// as a [`NotifyError`] instead.
#[derive(Error, Debug)]
pub enum BlunderError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// No async runtime to drive deliveries
    #[error("runtime error: {0}")]
    Runtime(String),

    /// HTTP client could not be built
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics error
    #[error("metrics error: {0}")]
    Metrics(String),
}

/// Why a notification did not produce a collector id
///
/// Every variant is delivered through the notification's `Deferred`. The type is
/// `Clone` because a settled outcome is handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    /// `notify` was called without a usable error
    #[error("blunder: got err={0}, wanted an Error")]
    Validation(String),

    /// Host-level window error dropped because `ignore_window_error` is set
    #[error("blunder: window error is ignored")]
    SuppressedByConfig,

    /// A filter vetoed delivery
    #[error("blunder: error is filtered")]
    Filtered,

    /// Collector answered 401
    #[error("blunder: unauthorized: project id or key are wrong")]
    Unauthorized,

    /// Collector answered 429, or the reset window has not passed yet
    #[error("blunder: IP is rate limited")]
    RateLimited,

    /// Collector answered with `{"error": "..."}`
    #[error("{0}")]
    Rejected(String),

    /// Collector answered with something we do not understand
    #[error("blunder: {reporter}: unexpected response: code={status} body='{body}'")]
    UnexpectedResponse {
        reporter: &'static str,
        status: u16,
        body: String,
    },

    /// Network or client failure before a response arrived
    #[error("blunder: transport error: {0}")]
    Transport(String),

    /// Dropped from a full offline buffer before it could be sent
    #[error("blunder: dropped from offline buffer (capacity {capacity})")]
    Evicted { capacity: usize },
}

impl NotifyError {
    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            NotifyError::Validation(_) => "validation",
            NotifyError::SuppressedByConfig => "suppressed",
            NotifyError::Filtered => "filtered",
            NotifyError::Unauthorized => "unauthorized",
            NotifyError::RateLimited => "rate_limited",
            NotifyError::Rejected(_) => "rejected",
            NotifyError::UnexpectedResponse { .. } => "unexpected_response",
            NotifyError::Transport(_) => "transport",
            NotifyError::Evicted { .. } => "evicted",
        }
    }
}
