//! blunder-notify - send one notice to a Blunder collector
//!
//! ## Usage
//!
//! ```bash
//! BLUNDER_PROJECT_ID=17 BLUNDER_PROJECT_KEY=secret blunder-notify "disk full"
//!
//! # Print Prometheus metrics after sending
//! blunder-notify --metrics "disk full"
//! ```
//!
//! ## Environment Variables
//!
//! - `BLUNDER_PROJECT_ID`, `BLUNDER_PROJECT_KEY`: collector credentials
//! - `BLUNDER_HOST`: collector base URL (default: "https://collector.blunderify.se")
//! - `BLUNDER_REPORTER`: `fetch`, `xhr` or `node` (default: detected)
//! - `BLUNDER_LOG_LEVEL`: log level (default: "info")
//! - `BLUNDER_LOG_FORMAT`: `pretty` or `json` (default: "pretty")

use anyhow::{Context, bail};
use blunder::config::{LogConfig, LogFormat, Options};
use blunder::metrics::{self, Metrics};
use blunder::{CapturedError, Client, Notification};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log = LogConfig::from_env()?;
    init_tracing(&log);

    let mut print_metrics = false;
    let mut words = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--metrics" => print_metrics = true,
            _ => words.push(arg),
        }
    }
    if words.is_empty() {
        bail!("usage: blunder-notify [--metrics] <message>");
    }
    let message = words.join(" ");

    Metrics::init()?;
    let options = Options::from_env()?;
    info!(
        project_id = %options.project_id,
        host = %options.host,
        "sending notice"
    );

    let client = Client::new(options)?;
    let deferred = client.notify(
        Notification::from(CapturedError::msg(message).with_current_backtrace())
            .with_context("severity", "error"),
    );

    let outcome = tokio::select! {
        outcome = deferred.wait() => outcome,
        _ = signal::ctrl_c() => bail!("interrupted before the collector answered"),
    };

    if print_metrics {
        print!("{}", metrics::gather());
    }

    let notice = outcome.context("collector did not accept the notice")?;
    println!("{}", notice.id);
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| log.level.as_str().into());
    let registry = tracing_subscriber::registry().with(filter);

    match log.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}
