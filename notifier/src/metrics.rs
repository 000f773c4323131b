//! Prometheus metrics for Blunder
//!
//! Recording is a no-op until [`Metrics::init`] has been called, so libraries
//! embedding the notifier pay nothing unless the application opts in.

use crate::error::{BlunderError, Result};
use prometheus::{
    CounterVec, Encoder, Gauge, IntCounter, TextEncoder, register_counter_vec, register_gauge,
    register_int_counter,
};
use std::sync::OnceLock;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// All Blunder metrics
pub struct Metrics {
    /// Notifications settled (by outcome: `delivered` or a `NotifyError` kind)
    pub notices: CounterVec,

    /// Reporter responses (by reporter, result)
    pub reporter_responses: CounterVec,

    /// Entries currently held in offline buffers
    pub offline_buffered: Gauge,

    /// Offline entries dropped for capacity
    pub offline_evicted: IntCounter,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    ///
    /// Returns error if metric registration fails.
    pub fn init() -> Result<&'static Metrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            notices: register_counter_vec!(
                "blunder_notices_total",
                "Notifications settled, by outcome",
                &["outcome"]
            )
            .map_err(|e| BlunderError::Metrics(format!("notices: {e}")))?,

            reporter_responses: register_counter_vec!(
                "blunder_reporter_responses_total",
                "Delivery attempts, by reporter and result",
                &["reporter", "result"]
            )
            .map_err(|e| BlunderError::Metrics(format!("reporter_responses: {e}")))?,

            offline_buffered: register_gauge!(
                "blunder_offline_buffered",
                "Notifications waiting in offline buffers"
            )
            .map_err(|e| BlunderError::Metrics(format!("offline_buffered: {e}")))?,

            offline_evicted: register_int_counter!(
                "blunder_offline_evicted_total",
                "Offline notifications dropped because the buffer was full"
            )
            .map_err(|e| BlunderError::Metrics(format!("offline_evicted: {e}")))?,
        };

        // Set the metrics (only succeeds once)
        let _ = METRICS.set(metrics);

        METRICS
            .get()
            .ok_or_else(|| BlunderError::Metrics("failed to initialize metrics".to_string()))
    }

    /// Get the global metrics instance
    ///
    /// Returns None if metrics haven't been initialized yet.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    pub fn record_notice(&self, outcome: &str) {
        self.notices.with_label_values(&[outcome]).inc();
    }

    pub fn record_response(&self, reporter: &str, result: &str) {
        self.reporter_responses
            .with_label_values(&[reporter, result])
            .inc();
    }

    pub fn add_offline(&self, delta: f64) {
        self.offline_buffered.add(delta);
    }

    pub fn record_evicted(&self, count: u64) {
        self.offline_evicted.inc_by(count);
    }
}

/// Gather all metrics and encode as Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}

/// Record a settled notification if metrics are initialized
pub fn try_record_notice(outcome: &str) {
    if let Some(m) = Metrics::get() {
        m.record_notice(outcome);
    }
}

/// Record a reporter result if metrics are initialized
pub fn try_record_response(reporter: &str, result: &str) {
    if let Some(m) = Metrics::get() {
        m.record_response(reporter, result);
    }
}

/// Adjust the offline gauge if metrics are initialized
pub fn try_add_offline(delta: f64) {
    if let Some(m) = Metrics::get() {
        m.add_offline(delta);
    }
}

/// Record evictions if metrics are initialized
pub fn try_record_evicted(count: u64) {
    if let Some(m) = Metrics::get() {
        m.record_evicted(count);
    }
}
