//! Access log sink
//!
//! Renders [`AccessRecord`]s with an Apache-like format string and emits
//! them on the `gantry::access` target. Supported atoms:
//!
//! | Atom          | Value                              |
//! |---------------|------------------------------------|
//! | `h`           | remote address                     |
//! | `t`           | request start time                 |
//! | `r`           | request line                       |
//! | `m`           | request method                     |
//! | `U`           | URL path                           |
//! | `q`           | query string                       |
//! | `s`           | status                             |
//! | `b`           | response length, `-` when empty    |
//! | `B`           | response length                    |
//! | `f`           | referer                            |
//! | `a`           | user agent                         |
//! | `T`           | request time in seconds            |
//! | `D`           | request time in microseconds       |
//! | `L`           | request time in decimal seconds    |
//! | `{name}i`     | request header                     |
//! | `{name}o`     | response header                    |

use gantry_core::AccessRecord;

/// Default access log format
pub const DEFAULT_FORMAT: &str = r#"%(h)s "%(r)s" %(s)s %(b)s %(D)s"#;

/// Access logger writing through `tracing`
#[derive(Debug, Clone)]
pub struct TracingAccessLog {
    format: String,
    enabled: bool,
}

impl Default for TracingAccessLog {
    fn default() -> Self {
        Self::new(DEFAULT_FORMAT)
    }
}

impl TracingAccessLog {
    /// Create an access log with the given format
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            enabled: true,
        }
    }

    /// Create an access log from the logging section of the config
    pub fn from_config(config: &gantry_core::LoggingConfig) -> Self {
        Self {
            format: config.access_log_format.clone(),
            enabled: !config.disable_access_log,
        }
    }

    /// Check if records are emitted
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Emit one access record
    pub fn log(&self, record: &AccessRecord) {
        if !self.enabled {
            return;
        }
        tracing::info!(
            target: "gantry::access",
            status = record.status,
            response_length = record.response_length,
            elapsed_us = record.elapsed_micros() as u64,
            "{}",
            self.format(record)
        );
    }

    /// Render a record with the configured format
    pub fn format(&self, record: &AccessRecord) -> String {
        let mut out = String::with_capacity(self.format.len() + 64);
        let mut rest = self.format.as_str();

        while let Some(start) = rest.find("%(") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find(")s") {
                Some(end) => {
                    out.push_str(&atom(&after[..end], record));
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

fn atom(name: &str, record: &AccessRecord) -> String {
    if let Some(inner) = name.strip_prefix('{') {
        if let Some(header) = inner.strip_suffix("}i") {
            return or_dash(record.request_header(header));
        }
        if let Some(header) = inner.strip_suffix("}o") {
            return or_dash(record.response_header(header));
        }
    }

    match name {
        "h" => record
            .remote_addr
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "-".to_string()),
        "t" => record.timestamp.format("[%d/%b/%Y:%H:%M:%S %z]").to_string(),
        "r" => record.request_line.clone(),
        "m" => record.method.clone(),
        "U" => record.path.clone(),
        "q" => record.query.clone(),
        "s" => record.status.to_string(),
        "b" if record.response_length == 0 => "-".to_string(),
        "b" | "B" => record.response_length.to_string(),
        "f" => or_dash(record.request_header("referer")),
        "a" => or_dash(record.request_header("user-agent")),
        "T" => record.elapsed.as_secs().to_string(),
        "D" => record.elapsed_micros().to_string(),
        "L" => format!("{:.6}", record.elapsed.as_secs_f64()),
        _ => "-".to_string(),
    }
}

fn or_dash(value: Option<&str>) -> String {
    value.unwrap_or("-").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn record() -> AccessRecord {
        AccessRecord {
            request_line: "GET /index?x=1 HTTP/1.1".to_string(),
            method: "GET".to_string(),
            path: "/index".to_string(),
            query: "x=1".to_string(),
            status: 200,
            response_headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
            response_length: 12,
            remote_addr: Some("10.1.2.3:5555".parse().unwrap()),
            elapsed: Duration::from_micros(1500),
            request_headers: vec![("User-Agent".to_string(), "curl/8".to_string())],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_default_format() {
        let log = TracingAccessLog::default();
        assert_eq!(log.format(&record()), r#"10.1.2.3 "GET /index?x=1 HTTP/1.1" 200 12 1500"#);
    }

    #[test]
    fn test_header_atoms() {
        let log = TracingAccessLog::new("%(a)s|%({content-type}o)s|%({x-missing}i)s|%(f)s");
        assert_eq!(log.format(&record()), "curl/8|text/plain|-|-");
    }

    #[test]
    fn test_empty_body_and_unknown_atoms() {
        let mut rec = record();
        rec.response_length = 0;
        rec.remote_addr = None;
        let log = TracingAccessLog::new("%(h)s %(b)s %(B)s %(zz)s %(unterminated");
        assert_eq!(log.format(&rec), "- - 0 - %(unterminated");
    }

    #[test]
    fn test_from_config() {
        let config = gantry_core::LoggingConfig {
            disable_access_log: true,
            ..Default::default()
        };
        let log = TracingAccessLog::from_config(&config);
        assert!(!log.enabled());
        log.log(&record());
    }
}
