//! Configuration structures for Gantry

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for a Gantry worker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GantryConfig {
    /// Worker configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Listening socket configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Telemetry configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl GantryConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| crate::Error::Configuration(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| crate::Error::Configuration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Merge configuration from file and environment
    pub fn load(path: Option<impl AsRef<Path>>) -> crate::Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };

        // Environment variables take precedence over the file
        config.apply_env()?;
        config.validate()?;

        Ok(config)
    }

    fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(class) = std::env::var("GANTRY_WORKER_CLASS") {
            self.worker.worker_class = class.parse().map_err(crate::Error::Configuration)?;
        }
        if let Some(v) = env_number("GANTRY_MAX_REQUESTS")? {
            self.worker.max_requests = v;
        }
        if let Some(v) = env_number("GANTRY_WORKER_CONNECTIONS")? {
            self.worker.worker_connections = v as usize;
        }
        if let Some(v) = env_number("GANTRY_GRACEFUL_TIMEOUT")? {
            self.worker.graceful_timeout = v;
        }
        if let Some(v) = env_number("GANTRY_KEEPALIVE")? {
            self.worker.keepalive = v;
        }
        if let Ok(bind) = std::env::var("GANTRY_BIND") {
            self.server.bind = bind;
        }
        if let Some(v) = env_number("GANTRY_FD")? {
            self.server.fd = Some(v as i32);
        }
        if let Ok(level) = std::env::var("GANTRY_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Reject settings the worker cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.worker.worker_connections == 0 {
            return Err(crate::Error::Configuration(
                "worker_connections must be at least 1".to_string(),
            ));
        }
        if self.worker.worker_connections > MAX_WORKER_CONNECTIONS {
            return Err(crate::Error::Configuration(format!(
                "worker_connections must be at most {}",
                MAX_WORKER_CONNECTIONS
            )));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(crate::Error::Configuration(
                "poll_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_number(name: &str) -> crate::Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| crate::Error::Configuration(format!("{} is not a number: {}", name, e))),
        Err(_) => Ok(None),
    }
}

/// Worker kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerClass {
    /// One connection at a time, blocking accept
    #[default]
    Sync,
    /// Many connections multiplexed on one thread
    Cooperative,
}

impl WorkerClass {
    /// Name used in logs, metrics and the environ
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerClass::Sync => "sync",
            WorkerClass::Cooperative => "cooperative",
        }
    }
}

impl std::fmt::Display for WorkerClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sync" => Ok(WorkerClass::Sync),
            "cooperative" | "async" | "coop" => Ok(WorkerClass::Cooperative),
            _ => Err(format!("Unknown worker class: {}", s)),
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker kind
    #[serde(default)]
    pub worker_class: WorkerClass,

    /// Requests served before the worker restarts itself (0 = unlimited)
    #[serde(default)]
    pub max_requests: u64,

    /// Maximum concurrent connections (cooperative workers only)
    #[serde(default = "default_worker_connections")]
    pub worker_connections: usize,

    /// Seconds to wait for in-flight connections on shutdown
    #[serde(default = "default_graceful_timeout")]
    pub graceful_timeout: u64,

    /// Seconds to wait for the next request on an idle connection
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,

    /// Seconds without a heartbeat before a monitor considers the worker hung
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Control loop interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum size of the request line plus headers in bytes
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,

    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Upper bound on `worker_connections`
pub const MAX_WORKER_CONNECTIONS: usize = 1 << 20;

fn default_worker_connections() -> usize {
    1000
}

fn default_graceful_timeout() -> u64 {
    30
}

fn default_keepalive() -> u64 {
    2
}

fn default_timeout() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_header_bytes() -> usize {
    8190 + 4096
}

fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024 // 16MB
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_class: WorkerClass::default(),
            max_requests: 0,
            worker_connections: default_worker_connections(),
            graceful_timeout: default_graceful_timeout(),
            keepalive: default_keepalive(),
            timeout: default_timeout(),
            poll_interval_ms: default_poll_interval_ms(),
            max_header_bytes: default_max_header_bytes(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl WorkerConfig {
    /// Effective request limit, with 0 meaning unlimited
    pub fn max_requests_limit(&self) -> u64 {
        if self.max_requests == 0 {
            u64::MAX
        } else {
            self.max_requests
        }
    }

    /// Graceful shutdown bound
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout)
    }

    /// Idle read bound for keep-alive connections
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive)
    }

    /// Heartbeat staleness bound
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Control loop interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Listening socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind when no socket is inherited
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Listening socket descriptor inherited from the supervisor
    pub fd: Option<i32>,

    /// Listen backlog when binding
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_backlog() -> i32 {
    2048
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            fd: None,
            backlog: default_backlog(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty or compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Access log line format
    #[serde(default = "default_access_log_format")]
    pub access_log_format: String,

    /// Disable the access log
    #[serde(default)]
    pub disable_access_log: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_access_log_format() -> String {
    r#"%(h)s "%(r)s" %(s)s %(b)s %(D)s"#.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            access_log_format: default_access_log_format(),
            disable_access_log: false,
        }
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            prometheus_enabled: default_true(),
        }
    }
}
