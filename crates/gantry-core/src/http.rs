//! Request type and the default HTTP/1.x request parser

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::CycleError;

/// A parsed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request method, e.g. `GET`
    pub method: String,

    /// URI exactly as sent on the request line
    pub uri: String,

    /// Path component of the URI
    pub path: String,

    /// Query string without the leading `?`
    pub query: String,

    /// Protocol version, e.g. `HTTP/1.1`
    pub version: String,

    /// Headers in arrival order
    pub headers: Vec<(String, String)>,

    /// Request body
    pub body: Bytes,
}

impl Request {
    /// Create a bodiless request, mostly useful for tests and hooks
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let (path, query) = split_uri(&uri);
        Self {
            method: method.into(),
            path,
            query,
            uri,
            version: "HTTP/1.1".to_string(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header with the given name, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Request line as it would appear on the wire
    pub fn request_line(&self) -> String {
        format!("{} {} {}", self.method, self.uri, self.version)
    }

    /// Check if the client asked to reuse the connection
    pub fn wants_keep_alive(&self) -> bool {
        let connection = self.header("connection").map(|v| v.to_ascii_lowercase());
        match connection.as_deref() {
            Some(v) if v.contains("close") => false,
            Some(v) if v.contains("keep-alive") => true,
            _ => self.version == "HTTP/1.1",
        }
    }
}

fn split_uri(uri: &str) -> (String, String) {
    // Absolute-form targets keep only their path
    let target = match uri.find("://") {
        Some(scheme_end) => {
            let rest = &uri[scheme_end + 3..];
            rest.find('/').map(|i| &rest[i..]).unwrap_or("/")
        }
        None => uri,
    };
    let target = target.split('#').next().unwrap_or_default();
    match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target.to_string(), String::new()),
    }
}

/// Produces requests from a connection.
///
/// A parser must report a connection that closes before sending anything as
/// [`CycleError::StreamEnded`], and malformed input as [`CycleError::Parse`].
#[async_trait]
pub trait RequestParser: Send + Sync {
    /// Read the next request from the connection
    async fn parse(&self, conn: &mut (dyn AsyncBufRead + Unpin + Send))
        -> Result<Request, CycleError>;
}

/// Minimal HTTP/1.0 and HTTP/1.1 parser
#[derive(Debug, Clone)]
pub struct HttpParser {
    max_header_bytes: usize,
    max_body_bytes: usize,
}

impl Default for HttpParser {
    fn default() -> Self {
        Self::new(8190 + 4096, 16 * 1024 * 1024)
    }
}

impl HttpParser {
    /// Create a parser with the given limits
    pub fn new(max_header_bytes: usize, max_body_bytes: usize) -> Self {
        Self {
            max_header_bytes,
            max_body_bytes,
        }
    }

    /// Create a parser from worker configuration
    pub fn from_config(config: &crate::WorkerConfig) -> Self {
        Self::new(config.max_header_bytes, config.max_body_bytes)
    }
}

#[async_trait]
impl RequestParser for HttpParser {
    async fn parse(
        &self,
        conn: &mut (dyn AsyncBufRead + Unpin + Send),
    ) -> Result<Request, CycleError> {
        let mut budget = self.max_header_bytes;

        // Request line, tolerating stray blank lines from a previous request
        let line = loop {
            match read_line(conn, &mut budget).await? {
                Some(line) if line.is_empty() => continue,
                Some(line) => break line,
                None => return Err(CycleError::StreamEnded),
            }
        };

        let mut parts = line.split(' ');
        let (method, uri, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(u), Some(v), None) => (m, u, v),
            _ => return Err(CycleError::Parse(format!("invalid request line: {:?}", line))),
        };
        if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase() || b == b'-') {
            return Err(CycleError::Parse(format!("invalid method: {:?}", method)));
        }
        if uri.is_empty() {
            return Err(CycleError::Parse("empty request target".into()));
        }
        if version != "HTTP/1.0" && version != "HTTP/1.1" {
            return Err(CycleError::Parse(format!("unsupported version: {:?}", version)));
        }

        let mut request = Request::new(method, uri);
        request.version = version.to_string();

        loop {
            let line = read_line(conn, &mut budget)
                .await?
                .ok_or_else(|| CycleError::Parse("incomplete request headers".into()))?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| CycleError::Parse(format!("invalid header: {:?}", line)))?;
            if name.is_empty() || name.bytes().any(|b| b.is_ascii_whitespace()) {
                return Err(CycleError::Parse(format!("invalid header name: {:?}", name)));
            }
            request
                .headers
                .push((name.to_string(), value.trim().to_string()));
        }

        if request.header("transfer-encoding").is_some() {
            return Err(CycleError::Parse("chunked request bodies are not supported".into()));
        }

        if let Some(raw) = request.header("content-length") {
            let len: usize = raw
                .trim()
                .parse()
                .map_err(|_| CycleError::Parse(format!("invalid content-length: {:?}", raw)))?;
            if len > self.max_body_bytes {
                return Err(CycleError::Parse(format!("request body too large: {} bytes", len)));
            }
            let mut body = vec![0u8; len];
            conn.read_exact(&mut body).await.map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => CycleError::Parse("incomplete request body".into()),
                _ => CycleError::from_io(e),
            })?;
            request.body = Bytes::from(body);
        }

        Ok(request)
    }
}

/// Read one CRLF or LF terminated line, charging it against `budget`.
/// Returns `None` when the stream ends cleanly before the line starts.
async fn read_line(
    conn: &mut (dyn AsyncBufRead + Unpin + Send),
    budget: &mut usize,
) -> Result<Option<String>, CycleError> {
    let mut line = Vec::new();
    loop {
        let available = conn.fill_buf().await.map_err(CycleError::from_io)?;
        if available.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            return Err(CycleError::Parse("incomplete request".into()));
        }
        let (done, used) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (true, i + 1),
            None => (false, available.len()),
        };
        if used > *budget {
            return Err(CycleError::Parse("request header too large".into()));
        }
        *budget -= used;
        line.extend_from_slice(&available[..used]);
        conn.consume(used);

        if done {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return String::from_utf8(line)
                .map(Some)
                .map_err(|_| CycleError::Parse("request head is not valid UTF-8".into()));
        }
    }
}
