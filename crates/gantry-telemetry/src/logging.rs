//! Structured logging for Gantry
//!
//! Provides structured logging with:
//! - Configurable log levels
//! - Environment-based filtering
//! - JSON, pretty or compact output
//! - Worker/connection context injection

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use tracing::Subscriber;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::UtcTime},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::{TelemetryError, TelemetryResult};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Enable logging
    pub enabled: bool,

    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Output format (json, pretty, compact)
    pub format: LogFormat,

    /// Include span events
    pub include_spans: bool,

    /// Include file/line information
    pub include_location: bool,

    /// Include target (module path)
    pub include_target: bool,

    /// Include thread IDs
    pub include_thread_ids: bool,

    /// Environment filter string (e.g., "gantry=debug,gantry::access=info")
    pub env_filter: Option<String>,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (machine-readable)
    Json,
    /// Pretty format (human-readable, colored)
    Pretty,
    /// Compact format (single line)
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(TelemetryError::Config(format!("unknown log format: {}", other))),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            format: LogFormat::Compact,
            include_spans: false,
            include_location: false,
            include_target: true,
            include_thread_ids: false,
            env_filter: None,
        }
    }
}

impl LoggingConfig {
    /// Build from the worker configuration file section
    pub fn from_core(config: &gantry_core::LoggingConfig) -> TelemetryResult<Self> {
        Ok(Self {
            level: config.level.clone(),
            format: config.format.parse()?,
            ..Self::default()
        })
    }
}

/// Initialize logging with configuration
pub fn init_logging(config: LoggingConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    // RUST_LOG wins over the configured filter
    let filter = match (&config.env_filter, std::env::var("RUST_LOG")) {
        (_, Ok(from_env)) if !from_env.is_empty() => EnvFilter::try_new(from_env),
        (Some(filter_str), _) => EnvFilter::try_new(filter_str),
        (None, _) => EnvFilter::try_new(&config.level),
    }
    .map_err(|e| TelemetryError::Logging(e.to_string()))?;

    tracing_subscriber::registry()
        .with(fmt_layer(&config).with_filter(filter))
        .try_init()
        .map_err(|e| TelemetryError::Logging(e.to_string()))?;

    tracing::debug!(
        "Logging initialized with level: {}, format: {:?}",
        config.level,
        config.format
    );

    Ok(())
}

/// Formatting layer for the configured output format
fn fmt_layer<S>(config: &LoggingConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    let span_events = if config.include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_span_events(span_events)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_target(config.include_target)
        .with_thread_ids(config.include_thread_ids);

    match config.format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}

/// Worker log context
#[derive(Debug, Clone)]
pub struct WorkerLogContext {
    pub worker_id: String,
    pub worker_class: String,
    pub ppid: i32,
}

impl WorkerLogContext {
    /// Create a new worker log context
    pub fn new(worker_id: &str, worker_class: &str, ppid: i32) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            worker_class: worker_class.to_string(),
            ppid,
        }
    }

    /// Create a tracing span with this context
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "worker",
            worker_id = %self.worker_id,
            worker_class = %self.worker_class,
            ppid = self.ppid
        )
    }
}

/// Connection log context
#[derive(Debug, Clone)]
pub struct ConnectionLogContext {
    pub peer: Option<SocketAddr>,
    pub nr: u64,
}

impl ConnectionLogContext {
    /// Create a new connection log context
    pub fn new(peer: Option<SocketAddr>, nr: u64) -> Self {
        Self { peer, nr }
    }

    /// Create a tracing span with this context
    pub fn span(&self) -> tracing::Span {
        match self.peer {
            Some(peer) => tracing::debug_span!("connection", peer = %peer, nr = self.nr),
            None => tracing::debug_span!("connection", nr = self.nr),
        }
    }
}

/// Log worker boot
#[macro_export]
macro_rules! log_worker_booted {
    ($worker_id:expr, $worker_class:expr) => {
        tracing::info!(
            worker_id = %$worker_id,
            worker_class = %$worker_class,
            event = "worker.booted",
            "Booting worker"
        )
    };
}

/// Log worker exit
#[macro_export]
macro_rules! log_worker_exiting {
    ($worker_id:expr, $nr:expr) => {
        tracing::info!(
            worker_id = %$worker_id,
            nr = $nr,
            event = "worker.exiting",
            "Worker exiting"
        )
    };
}

/// Log parent change
#[macro_export]
macro_rules! log_parent_changed {
    ($worker_id:expr, $ppid:expr) => {
        tracing::info!(
            worker_id = %$worker_id,
            ppid = $ppid,
            event = "worker.parent_changed",
            "Parent changed, shutting down"
        )
    };
}

/// Log connection closed before a request arrived
#[macro_export]
macro_rules! log_connection_closed {
    ($reason:expr) => {
        tracing::debug!(
            reason = %$reason,
            event = "connection.closed",
            "Closing connection"
        )
    };
}

/// Log request failure
#[macro_export]
macro_rules! log_request_failed {
    ($error:expr) => {
        tracing::error!(
            error = %$error,
            event = "request.failed",
            "Error processing request."
        )
    };
}
