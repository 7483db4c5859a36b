//! Prometheus metrics for Gantry
//!
//! Provides metrics for monitoring worker processes:
//! - Request counters by worker class and outcome
//! - Request duration histogram
//! - In-flight connection gauge
//! - Heartbeat and autorestart tracking

use lazy_static::lazy_static;
use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::{TelemetryError, TelemetryResult};

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============ Request Metrics ============

    /// Total requests handled
    pub static ref REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("gantry_requests_total", "Total number of request cycles"),
        &["worker_class", "outcome"]
    ).expect("metric can be created");

    /// Request duration
    pub static ref REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("gantry_request_duration_seconds", "Time spent in one request cycle")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
        &["worker_class"]
    ).expect("metric can be created");

    // ============ Worker Metrics ============

    /// Connections currently being served
    pub static ref CONNECTIONS_IN_FLIGHT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("gantry_connections_in_flight", "Number of connections currently being served"),
        &["worker_id"]
    ).expect("metric can be created");

    /// Worker heartbeat timestamp
    pub static ref WORKER_HEARTBEAT: GaugeVec = GaugeVec::new(
        Opts::new("gantry_worker_heartbeat_timestamp", "Last heartbeat timestamp"),
        &["worker_id"]
    ).expect("metric can be created");

    /// Self-initiated restarts after max_requests
    pub static ref WORKER_AUTORESTARTS: IntCounterVec = IntCounterVec::new(
        Opts::new("gantry_worker_autorestarts_total", "Total workers that reached max_requests"),
        &["worker_class"]
    ).expect("metric can be created");
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics collection
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl From<&gantry_core::TelemetryConfig> for MetricsConfig {
    fn from(config: &gantry_core::TelemetryConfig) -> Self {
        Self {
            enabled: config.prometheus_enabled,
        }
    }
}

/// Gantry metrics interface
pub struct GantryMetrics {
    config: MetricsConfig,
}

impl GantryMetrics {
    /// Initialize metrics with configuration
    pub fn new(config: MetricsConfig) -> TelemetryResult<Self> {
        if config.enabled {
            Self::register_metrics()?;
        }

        Ok(Self { config })
    }

    /// Check if metrics collection is enabled
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn register_metrics() -> TelemetryResult<()> {
        register(Box::new(REQUESTS_TOTAL.clone()))?;
        register(Box::new(REQUEST_DURATION.clone()))?;
        register(Box::new(CONNECTIONS_IN_FLIGHT.clone()))?;
        register(Box::new(WORKER_HEARTBEAT.clone()))?;
        register(Box::new(WORKER_AUTORESTARTS.clone()))?;
        Ok(())
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> TelemetryResult<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = REGISTRY.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }

    /// Record a finished request cycle
    pub fn request_finished(worker_class: &str, outcome: &str, duration_secs: f64) {
        REQUESTS_TOTAL
            .with_label_values(&[worker_class, outcome])
            .inc();
        REQUEST_DURATION
            .with_label_values(&[worker_class])
            .observe(duration_secs);
    }

    /// Record a connection entering service
    pub fn connection_opened(worker_id: &str) {
        CONNECTIONS_IN_FLIGHT.with_label_values(&[worker_id]).inc();
    }

    /// Record a connection leaving service
    pub fn connection_closed(worker_id: &str) {
        CONNECTIONS_IN_FLIGHT.with_label_values(&[worker_id]).dec();
    }

    /// Record worker heartbeat
    pub fn record_worker_heartbeat(worker_id: &str) {
        let now = chrono::Utc::now().timestamp() as f64;
        WORKER_HEARTBEAT.with_label_values(&[worker_id]).set(now);
    }

    /// Record a worker reaching max_requests
    pub fn worker_autorestart(worker_class: &str) {
        WORKER_AUTORESTARTS.with_label_values(&[worker_class]).inc();
    }
}

fn register(collector: Box<dyn prometheus::core::Collector>) -> TelemetryResult<()> {
    match REGISTRY.register(collector) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => Ok(()),
        Err(e) => Err(TelemetryError::Metrics(e.to_string())),
    }
}

/// Timer guard recording request duration on drop
pub struct RequestTimer {
    start: Instant,
    worker_class: String,
    outcome: &'static str,
}

impl RequestTimer {
    /// Start timing a request cycle
    pub fn start(worker_class: &str) -> Self {
        Self {
            start: Instant::now(),
            worker_class: worker_class.to_string(),
            outcome: "completed",
        }
    }

    /// Set the outcome label recorded on drop
    pub fn set_outcome(&mut self, outcome: &'static str) {
        self.outcome = outcome;
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        GantryMetrics::request_finished(&self.worker_class, self.outcome, duration);
    }
}

/// Guard tracking one in-flight connection
pub struct ConnectionGuard {
    worker_id: String,
}

impl ConnectionGuard {
    /// Mark a connection as in flight until the guard drops
    pub fn new(worker_id: &str) -> Self {
        GantryMetrics::connection_opened(worker_id);
        Self {
            worker_id: worker_id.to_string(),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        GantryMetrics::connection_closed(&self.worker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_twice() {
        let first = GantryMetrics::new(MetricsConfig::default()).unwrap();
        let second = GantryMetrics::new(MetricsConfig::default()).unwrap();
        assert!(first.enabled());
        assert!(second.enabled());
    }

    #[test]
    fn test_request_timer_records() {
        let metrics = GantryMetrics::new(MetricsConfig::default()).unwrap();
        {
            let mut timer = RequestTimer::start("metrics-test");
            timer.set_outcome("failed");
        }
        let failed = REQUESTS_TOTAL
            .with_label_values(&["metrics-test", "failed"])
            .get();
        assert_eq!(failed, 1);

        let text = metrics.gather().unwrap();
        assert!(text.contains("gantry_requests_total"));
    }

    #[test]
    fn test_connection_guard_balances() {
        let gauge = CONNECTIONS_IN_FLIGHT.with_label_values(&["guard-test"]);
        {
            let _a = ConnectionGuard::new("guard-test");
            let _b = ConnectionGuard::new("guard-test");
            assert_eq!(gauge.get(), 2);
        }
        assert_eq!(gauge.get(), 0);
    }
}
