//! Configuration for Blunder

use crate::error::{BlunderError, Result};
use crate::filter::{DEFAULT_DEBOUNCE_WINDOW, PageInfo};
use crate::offline;
use crate::processor::Processor;
use crate::report::ReporterSpec;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Collector used when no host is configured
pub const DEFAULT_HOST: &str = "https://collector.blunderify.se";

/// Default per-request timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// User attached to every notice as `context.user`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Client configuration
#[derive(Clone)]
pub struct Options {
    pub project_id: String,
    pub project_key: String,

    /// Collector base URL
    pub host: String,

    /// Per-request timeout
    pub timeout: Duration,

    pub component: Option<String>,
    pub environment: String,
    pub user: Option<User>,

    /// Reject host-level window errors instead of reporting them
    pub ignore_window_error: bool,

    /// Debounce window for identical notices
    pub debounce: Duration,

    /// Initial reporter, detected from the host when unset
    pub reporter: Option<ReporterSpec>,

    /// Frame extractor, `BacktraceProcessor` when unset
    pub processor: Option<Arc<dyn Processor>>,

    /// Page info for browser-like hosts; selects browser enrichment
    pub page: Option<PageInfo>,

    /// Offline buffer capacity
    pub offline_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            project_key: String::new(),
            host: DEFAULT_HOST.to_string(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            component: None,
            environment: "production".to_string(),
            user: None,
            ignore_window_error: false,
            debounce: DEFAULT_DEBOUNCE_WINDOW,
            reporter: None,
            processor: None,
            page: None,
            offline_capacity: offline::DEFAULT_CAPACITY,
        }
    }
}

impl Options {
    /// Options for a project, everything else default
    pub fn new(project_id: impl Into<String>, project_key: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            project_key: project_key.into(),
            ..Self::default()
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn user(mut self, user: User) -> Self {
        self.user = Some(user);
        self
    }

    pub fn ignore_window_error(mut self, ignore: bool) -> Self {
        self.ignore_window_error = ignore;
        self
    }

    pub fn debounce(mut self, window: Duration) -> Self {
        self.debounce = window;
        self
    }

    pub fn reporter(mut self, reporter: impl Into<ReporterSpec>) -> Self {
        self.reporter = Some(reporter.into());
        self
    }

    pub fn processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn page(mut self, page: PageInfo) -> Self {
        self.page = Some(page);
        self
    }

    pub fn offline_capacity(mut self, capacity: usize) -> Self {
        self.offline_capacity = capacity;
        self
    }

    /// Load options from `BLUNDER_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut options = Options::default();

        if let Some(id) = lookup("BLUNDER_PROJECT_ID") {
            options.project_id = id;
        }

        if let Some(key) = lookup("BLUNDER_PROJECT_KEY") {
            options.project_key = key;
        }

        if let Some(host) = lookup("BLUNDER_HOST") {
            options.host = host;
        }

        if let Some(component) = lookup("BLUNDER_COMPONENT") {
            options.component = Some(component);
        }

        if let Some(environment) = lookup("BLUNDER_ENVIRONMENT") {
            options.environment = environment;
        }

        if let Some(timeout) = lookup("BLUNDER_TIMEOUT_MS") {
            let ms: u64 = timeout
                .parse()
                .map_err(|e| BlunderError::Config(format!("invalid BLUNDER_TIMEOUT_MS: {e}")))?;
            options.timeout = Duration::from_millis(ms);
        }

        if let Some(reporter) = lookup("BLUNDER_REPORTER") {
            options.reporter = Some(reporter.parse()?);
        }

        if let Some(ignore) = lookup("BLUNDER_IGNORE_WINDOW_ERROR") {
            options.ignore_window_error = parse_bool("BLUNDER_IGNORE_WINDOW_ERROR", &ignore)?;
        }

        if let Some(debounce) = lookup("BLUNDER_DEBOUNCE_MS") {
            let ms: u64 = debounce
                .parse()
                .map_err(|e| BlunderError::Config(format!("invalid BLUNDER_DEBOUNCE_MS: {e}")))?;
            options.debounce = Duration::from_millis(ms);
        }

        Ok(options)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(BlunderError::Config(format!(
            "invalid {name}: {other} (expected true or false)"
        ))),
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("project_id", &self.project_id)
            .field("project_key", &"<redacted>")
            .field("host", &self.host)
            .field("timeout", &self.timeout)
            .field("component", &self.component)
            .field("environment", &self.environment)
            .field("user", &self.user)
            .field("ignore_window_error", &self.ignore_window_error)
            .field("debounce", &self.debounce)
            .field("reporter", &self.reporter)
            .field("processor", &self.processor.as_ref().map(|p| p.name()))
            .field("page", &self.page)
            .field("offline_capacity", &self.offline_capacity)
            .finish()
    }
}

/// Logging setup for the binary
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl LogConfig {
    /// Load from `BLUNDER_LOG_LEVEL` and `BLUNDER_LOG_FORMAT`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = LogConfig::default();

        if let Some(level) = lookup("BLUNDER_LOG_LEVEL") {
            config.level = level;
        }

        if let Some(format) = lookup("BLUNDER_LOG_FORMAT") {
            config.format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => {
                    return Err(BlunderError::Config(format!(
                        "invalid BLUNDER_LOG_FORMAT: {other} (expected 'json' or 'pretty')"
                    )));
                }
            };
        }

        Ok(config)
    }
}
