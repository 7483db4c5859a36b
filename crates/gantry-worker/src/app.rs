//! Hosted application contract and built-in applications

use async_trait::async_trait;
use bytes::Bytes;
use gantry_core::response::ResponseWriter;
use gantry_core::{AppResponse, Body, CycleError, Environ, FileBody, Request};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tracing::{debug, error};

/// Errors raised by applications and hooks
#[derive(Error, Debug)]
pub enum AppError {
    /// Application-defined failure
    #[error("{0}")]
    Failed(String),

    /// Request cannot be served as sent
    #[error("bad request: {0}")]
    BadRequest(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<AppError> for CycleError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::BadRequest(msg) => CycleError::Parse(msg),
            other => CycleError::Application(other.to_string()),
        }
    }
}

/// The application hosted by a worker
#[async_trait]
pub trait Application: Send + Sync {
    /// Produce a response for one request
    async fn call(&self, request: &Request, environ: &Environ) -> Result<AppResponse, AppError>;

    /// Report a failed request.
    ///
    /// The default logs the error and, if nothing was sent yet, answers 400
    /// for malformed requests and 500 otherwise.
    async fn handle_error(
        &self,
        conn: &mut (dyn AsyncWrite + Unpin + Send),
        request: Option<&Request>,
        err: &CycleError,
        headers_sent: bool,
    ) {
        let status = match err {
            CycleError::Parse(_) => 400,
            _ => 500,
        };
        match request {
            Some(req) => error!(error = %err, request = %req.request_line(), "Error handling request"),
            None => error!(error = %err, "Error handling request"),
        }
        if headers_sent {
            return;
        }

        let version = request.map(|r| r.version.as_str()).unwrap_or("HTTP/1.0");
        let body = gantry_core::response::reason_phrase(status);
        let mut writer = ResponseWriter::new(conn, version, false);
        let sent = async {
            writer.start(
                status,
                vec![
                    ("Content-Type".to_string(), "text/plain".to_string()),
                    ("Content-Length".to_string(), body.len().to_string()),
                ],
            )?;
            writer.write(body.as_bytes()).await?;
            writer.close().await?;
            Ok::<(), CycleError>(())
        }
        .await;
        if let Err(e) = sent {
            debug!(error = %e, "Failed to send error response");
        }
    }
}

/// Answers every request with a fixed greeting
#[derive(Debug, Clone, Copy, Default)]
pub struct HelloApp;

#[async_trait]
impl Application for HelloApp {
    async fn call(&self, _request: &Request, _environ: &Environ) -> Result<AppResponse, AppError> {
        Ok(AppResponse::text(200, "Hello, World!\n"))
    }
}

/// Echoes the request body back in chunks
#[derive(Debug, Clone, Copy)]
pub struct EchoApp {
    chunk_size: usize,
}

impl Default for EchoApp {
    fn default() -> Self {
        Self { chunk_size: 4096 }
    }
}

impl EchoApp {
    /// Echo in chunks of at most `chunk_size` bytes
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }
}

#[async_trait]
impl Application for EchoApp {
    async fn call(&self, request: &Request, _environ: &Environ) -> Result<AppResponse, AppError> {
        let chunks: Vec<Bytes> = request
            .body
            .chunks(self.chunk_size)
            .map(Bytes::copy_from_slice)
            .collect();
        let content_type = request
            .header("content-type")
            .unwrap_or("application/octet-stream")
            .to_string();
        Ok(AppResponse::new(200)
            .header("Content-Type", content_type)
            .body(Body::from_chunks(chunks)))
    }
}

/// Sleeps for `?ms=N` milliseconds before answering
#[derive(Debug, Clone, Copy)]
pub struct SleepApp {
    default_ms: u64,
}

impl Default for SleepApp {
    fn default() -> Self {
        Self { default_ms: 1000 }
    }
}

impl SleepApp {
    /// Sleep for `ms` when the query does not say otherwise
    pub fn new(default_ms: u64) -> Self {
        Self { default_ms }
    }
}

#[async_trait]
impl Application for SleepApp {
    async fn call(&self, request: &Request, _environ: &Environ) -> Result<AppResponse, AppError> {
        let ms = match query_param(&request.query, "ms") {
            Some(raw) => raw
                .parse()
                .map_err(|_| AppError::BadRequest(format!("invalid ms: {:?}", raw)))?,
            None => self.default_ms,
        };
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(AppResponse::text(200, format!("slept {}ms\n", ms)))
    }
}

/// Fails every request
#[derive(Debug, Clone, Copy, Default)]
pub struct FailApp;

#[async_trait]
impl Application for FailApp {
    async fn call(&self, request: &Request, _environ: &Environ) -> Result<AppResponse, AppError> {
        Err(AppError::Failed(format!("intentional failure for {}", request.path)))
    }
}

/// Serves one file through the bulk transfer path
#[derive(Debug, Clone)]
pub struct FileApp {
    path: PathBuf,
    content_type: String,
}

impl FileApp {
    /// Serve `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            content_type: "application/octet-stream".to_string(),
        }
    }

    /// Set the response content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

#[async_trait]
impl Application for FileApp {
    async fn call(&self, _request: &Request, _environ: &Environ) -> Result<AppResponse, AppError> {
        let file = FileBody::open(&self.path).await?;
        Ok(AppResponse::new(200)
            .header("Content-Type", self.content_type.clone())
            .body(Body::File(file)))
    }
}

/// Look up a built-in application by name
pub fn builtin(name: &str) -> Option<Arc<dyn Application>> {
    match name {
        "hello" => Some(Arc::new(HelloApp)),
        "echo" => Some(Arc::new(EchoApp::default())),
        "sleep" => Some(Arc::new(SleepApp::default())),
        "fail" => Some(Arc::new(FailApp)),
        _ => name
            .strip_prefix("file:")
            .map(|path| Arc::new(FileApp::new(path)) as Arc<dyn Application>),
    }
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::ResponseBody;

    async fn drain(body: Body) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        if let Body::Chunks(mut body) = body {
            while let Some(chunk) = body.next_chunk().await {
                chunks.push(chunk.unwrap());
            }
        }
        chunks
    }

    #[tokio::test]
    async fn test_hello_app() {
        let resp = HelloApp.call(&Request::new("GET", "/"), &Environ::new()).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(drain(resp.body).await, vec![Bytes::from("Hello, World!\n")]);
    }

    #[tokio::test]
    async fn test_echo_app_chunks() {
        let mut req = Request::new("POST", "/echo");
        req.body = Bytes::from_static(b"abcdefg");
        let resp = EchoApp::with_chunk_size(3).call(&req, &Environ::new()).await.unwrap();
        assert_eq!(drain(resp.body).await, vec!["abc", "def", "g"]);
    }

    #[tokio::test]
    async fn test_sleep_app_query() {
        let req = Request::new("GET", "/sleep?ms=5");
        let resp = SleepApp::default().call(&req, &Environ::new()).await.unwrap();
        assert_eq!(resp.status, 200);

        let req = Request::new("GET", "/sleep?ms=abc");
        let err = SleepApp::default().call(&req, &Environ::new()).await.unwrap_err();
        assert!(matches!(CycleError::from(err), CycleError::Parse(_)));
    }

    #[tokio::test]
    async fn test_fail_app() {
        let err = FailApp.call(&Request::new("GET", "/x"), &Environ::new()).await.unwrap_err();
        assert!(matches!(CycleError::from(err), CycleError::Application(_)));
    }

    #[tokio::test]
    async fn test_default_error_response() {
        let mut out = Vec::new();
        let req = Request::new("GET", "/");
        HelloApp
            .handle_error(&mut out, Some(&req), &CycleError::Parse("bad".into()), false)
            .await;
        let raw = String::from_utf8(out).unwrap();
        assert!(raw.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(raw.ends_with("\r\n\r\nBad Request"));

        let mut out = Vec::new();
        HelloApp
            .handle_error(&mut out, None, &CycleError::Application("boom".into()), true)
            .await;
        assert!(out.is_empty());
    }

    #[test]
    fn test_builtin_lookup() {
        assert!(builtin("hello").is_some());
        assert!(builtin("file:/tmp/x").is_some());
        assert!(builtin("nope").is_none());
    }
}
