//! Prometheus metrics for the dispatcher

use crate::error::{DispatchError, Result};
use parking_lot::Mutex;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder, register_counter_vec, register_gauge,
    register_histogram_vec,
};
use std::sync::OnceLock;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Serializes registration so concurrent `init` calls don't double-register
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Outcome label for a forwarded call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    /// The plugin returned an error status
    Error,
    /// No connection to the plugin could be made
    DialFailed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Error => "error",
            Outcome::DialFailed => "dial_failed",
        }
    }
}

/// All dispatcher metrics
pub struct Metrics {
    // ─────────────────────────────────────────────────────────────────────────
    // Forwarding
    // ─────────────────────────────────────────────────────────────────────────
    /// Calls forwarded to plugins (by group, method, outcome)
    pub forwarded_calls: CounterVec,

    /// Round trip of a forwarded call in seconds (by group, method)
    pub forward_duration_seconds: HistogramVec,

    /// Failed in-memory connection attempts (by provider)
    pub dial_failures: CounterVec,

    // ─────────────────────────────────────────────────────────────────────────
    // Registry
    // ─────────────────────────────────────────────────────────────────────────
    /// Providers registered by discovery
    pub registered_providers: Gauge,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    ///
    /// Returns error if metric registration fails.
    #[allow(clippy::result_large_err)]
    pub fn init() -> Result<&'static Metrics> {
        let _guard = INIT_LOCK.lock();
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            forwarded_calls: register_counter_vec!(
                "modcsi_forwarded_calls_total",
                "Total CSI calls forwarded to plugins",
                &["group", "method", "outcome"]
            )
            .map_err(|e| DispatchError::Metrics(format!("forwarded_calls: {e}")))?,

            forward_duration_seconds: register_histogram_vec!(
                "modcsi_forward_duration_seconds",
                "Time spent forwarding a CSI call to a plugin",
                &["group", "method"],
                // Buckets: 100us to 10s
                vec![
                    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0
                ]
            )
            .map_err(|e| DispatchError::Metrics(format!("forward_duration_seconds: {e}")))?,

            dial_failures: register_counter_vec!(
                "modcsi_dial_failures_total",
                "Failed in-memory connections to a plugin",
                &["provider"]
            )
            .map_err(|e| DispatchError::Metrics(format!("dial_failures: {e}")))?,

            registered_providers: register_gauge!(
                "modcsi_registered_providers",
                "Number of registered endpoint providers"
            )
            .map_err(|e| DispatchError::Metrics(format!("registered_providers: {e}")))?,
        };

        // Set the metrics (only succeeds once)
        let _ = METRICS.set(metrics);

        METRICS
            .get()
            .ok_or_else(|| DispatchError::Metrics("Failed to initialize metrics".to_string()))
    }

    /// Get the global metrics instance
    ///
    /// Returns None if metrics haven't been initialized yet.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    /// Record a forwarded call
    pub fn record_forward(&self, group: &str, method: &str, outcome: Outcome, seconds: f64) {
        self.forwarded_calls
            .with_label_values(&[group, method, outcome.as_str()])
            .inc();
        self.forward_duration_seconds
            .with_label_values(&[group, method])
            .observe(seconds);
    }

    pub fn record_dial_failure(&self, provider: &str) {
        self.dial_failures.with_label_values(&[provider]).inc();
    }

    pub fn set_registered_providers(&self, count: usize) {
        self.registered_providers.set(count as f64);
    }
}

/// Gather all metrics as Prometheus text format
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

/// Record a forwarded call if metrics are initialized
pub fn try_record_forward(group: &str, method: &str, outcome: Outcome, seconds: f64) {
    if let Some(m) = Metrics::get() {
        m.record_forward(group, method, outcome, seconds);
    }
}

/// Record a dial failure if metrics are initialized
pub fn try_record_dial_failure(provider: &str) {
    if let Some(m) = Metrics::get() {
        m.record_dial_failure(provider);
    }
}
