//! Gantry Telemetry - Observability layer
//!
//! This crate provides observability for Gantry workers:
//! - Prometheus metrics for monitoring
//! - Structured logging
//! - The access log sink
//!
//! Enable features via feature flags:
//! - `metrics` (default) - Prometheus metrics

#[cfg(feature = "metrics")]
pub mod metrics;

pub mod access;
pub mod logging;

// Re-exports
#[cfg(feature = "metrics")]
pub use metrics::{GantryMetrics, MetricsConfig};

pub use access::TracingAccessLog;
pub use logging::{init_logging, LogFormat, LoggingConfig};

use thiserror::Error;

/// Telemetry errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
