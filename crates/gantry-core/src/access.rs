//! Access records for completed exchanges

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Everything an access logger needs about one exchange
#[derive(Debug, Clone, Serialize)]
pub struct AccessRecord {
    /// Request line, e.g. `GET /index HTTP/1.1`
    pub request_line: String,

    /// Request method
    pub method: String,

    /// Request path
    pub path: String,

    /// Query string
    pub query: String,

    /// Response status code
    pub status: u16,

    /// Response headers as sent by the application
    pub response_headers: Vec<(String, String)>,

    /// Body bytes written to the client
    pub response_length: u64,

    /// Client address, when known
    pub remote_addr: Option<SocketAddr>,

    /// Time from request start to response close
    pub elapsed: Duration,

    /// Request headers
    pub request_headers: Vec<(String, String)>,

    /// When the request started
    pub timestamp: DateTime<Utc>,
}

impl AccessRecord {
    /// Value of a request header, case-insensitively
    pub fn request_header(&self, name: &str) -> Option<&str> {
        find(&self.request_headers, name)
    }

    /// Value of a response header, case-insensitively
    pub fn response_header(&self, name: &str) -> Option<&str> {
        find(&self.response_headers, name)
    }

    /// Elapsed time in microseconds
    pub fn elapsed_micros(&self) -> u128 {
        self.elapsed.as_micros()
    }
}

fn find<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
