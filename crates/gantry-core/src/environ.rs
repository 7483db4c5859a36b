//! Per-request environment handed to the hosted application

use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::http::Request;
use crate::response::SERVER_SOFTWARE;

/// CGI-style request environment, ordered by key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environ {
    vars: BTreeMap<String, String>,
}

impl Environ {
    /// Create an empty environ
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Set a key, replacing any previous value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Check if a key is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Iterate over entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Check if the environ is empty
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Build the environ for one request
pub fn create(
    request: &Request,
    peer: Option<SocketAddr>,
    server: Option<SocketAddr>,
    worker_class: &str,
) -> Environ {
    let mut env = Environ::new();
    env.insert("GATEWAY_INTERFACE", "CGI/1.1");
    env.insert("SERVER_SOFTWARE", SERVER_SOFTWARE);
    env.insert("SCRIPT_NAME", "");
    env.insert("REQUEST_METHOD", request.method.as_str());
    env.insert("PATH_INFO", request.path.as_str());
    env.insert("QUERY_STRING", request.query.as_str());
    env.insert("RAW_URI", request.uri.as_str());
    env.insert("SERVER_PROTOCOL", request.version.as_str());
    env.insert("gantry.worker_class", worker_class);

    if let Some(server) = server {
        env.insert("SERVER_NAME", server.ip().to_string());
        env.insert("SERVER_PORT", server.port().to_string());
    }
    if let Some(peer) = peer {
        env.insert("REMOTE_ADDR", peer.ip().to_string());
        env.insert("REMOTE_PORT", peer.port().to_string());
    }

    for (name, value) in &request.headers {
        let key = name.to_ascii_uppercase().replace('-', "_");
        match key.as_str() {
            "CONTENT_TYPE" | "CONTENT_LENGTH" => env.insert(key.clone(), value.as_str()),
            "HOST" => {
                // Host wins over the socket address for SERVER_NAME
                let host = value.rsplit_once(':').map(|(h, _)| h).unwrap_or(value.as_str());
                env.insert("SERVER_NAME", host);
                env.insert("HTTP_HOST", value.as_str());
            }
            _ => {
                let key = format!("HTTP_{}", key);
                let merged = match env.get(&key) {
                    Some(existing) => format!("{},{}", existing, value),
                    None => value.clone(),
                };
                env.insert(key, merged);
            }
        }
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_environ() {
        let request = Request::new("POST", "/submit?a=1")
            .with_header("Host", "example.com:8080")
            .with_header("Content-Type", "text/plain")
            .with_header("X-Forwarded-For", "10.0.0.1")
            .with_header("x-forwarded-for", "10.0.0.2");
        let peer: SocketAddr = "192.168.1.5:41000".parse().unwrap();
        let server: SocketAddr = "127.0.0.1:8000".parse().unwrap();

        let env = create(&request, Some(peer), Some(server), "sync");

        assert_eq!(env.get("REQUEST_METHOD"), Some("POST"));
        assert_eq!(env.get("PATH_INFO"), Some("/submit"));
        assert_eq!(env.get("QUERY_STRING"), Some("a=1"));
        assert_eq!(env.get("RAW_URI"), Some("/submit?a=1"));
        assert_eq!(env.get("SERVER_PROTOCOL"), Some("HTTP/1.1"));
        assert_eq!(env.get("SERVER_NAME"), Some("example.com"));
        assert_eq!(env.get("SERVER_PORT"), Some("8000"));
        assert_eq!(env.get("REMOTE_ADDR"), Some("192.168.1.5"));
        assert_eq!(env.get("REMOTE_PORT"), Some("41000"));
        assert_eq!(env.get("CONTENT_TYPE"), Some("text/plain"));
        assert_eq!(env.get("HTTP_HOST"), Some("example.com:8080"));
        assert_eq!(env.get("HTTP_X_FORWARDED_FOR"), Some("10.0.0.1,10.0.0.2"));
        assert_eq!(env.get("gantry.worker_class"), Some("sync"));
        assert!(!env.contains_key("HTTP_CONTENT_TYPE"));
    }

    #[test]
    fn test_environ_without_addresses() {
        let env = create(&Request::new("GET", "/"), None, None, "cooperative");
        assert!(!env.contains_key("REMOTE_ADDR"));
        assert!(!env.contains_key("SERVER_NAME"));
        assert_eq!(env.get("SCRIPT_NAME"), Some(""));
    }
}
