//! Response bodies and the HTTP/1.x response writer

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::VecDeque;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::CycleError;

/// Value of the `Server` response header
pub const SERVER_SOFTWARE: &str = concat!("gantry/", env!("CARGO_PKG_VERSION"));

/// A lazily produced response body
#[async_trait]
pub trait ResponseBody: Send {
    /// Next chunk, or `None` once the body is exhausted
    async fn next_chunk(&mut self) -> Option<Result<Bytes, CycleError>>;

    /// Release resources held by the body
    async fn close(&mut self) {}
}

/// In-memory body made of pre-built chunks
#[derive(Debug, Default)]
pub struct ChunkedBody {
    chunks: VecDeque<Bytes>,
}

impl ChunkedBody {
    /// Create a body from chunks
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
        }
    }

    /// Total length of the remaining chunks
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    /// Check if no bytes remain
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResponseBody for ChunkedBody {
    async fn next_chunk(&mut self) -> Option<Result<Bytes, CycleError>> {
        self.chunks.pop_front().map(Ok)
    }
}

/// Whole-file body sent through the bulk transfer path
#[derive(Debug)]
pub struct FileBody {
    /// Open file positioned at the first byte to send
    pub file: tokio::fs::File,

    /// Bytes to send, if known up front
    pub len: Option<u64>,
}

impl FileBody {
    /// Open a file for sending
    pub async fn open(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await.ok().map(|m| m.len());
        Ok(Self { file, len })
    }
}

/// Response body returned by an application
pub enum Body {
    /// Sequence of chunks written one by one
    Chunks(Box<dyn ResponseBody>),
    /// File sent in bulk
    File(FileBody),
}

impl Body {
    /// Empty body
    pub fn empty() -> Self {
        Body::Chunks(Box::new(ChunkedBody::default()))
    }

    /// Body from in-memory chunks
    pub fn from_chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Body::Chunks(Box::new(ChunkedBody::new(chunks)))
    }

    /// Check if this body takes the bulk file path
    pub fn is_file(&self) -> bool {
        matches!(self, Body::File(_))
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Chunks(_) => f.write_str("Body::Chunks"),
            Body::File(file) => f.debug_tuple("Body::File").field(&file.len).finish(),
        }
    }
}

/// What an application hands back for one request
#[derive(Debug)]
pub struct AppResponse {
    /// Status code
    pub status: u16,

    /// Response headers set by the application
    pub headers: Vec<(String, String)>,

    /// Response body
    pub body: Body,
}

impl AppResponse {
    /// Create a response with an empty body
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Body::empty(),
        }
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body
    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Plain-text response
    pub fn text(status: u16, text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .header("Content-Length", text.len().to_string())
            .body(Body::from_chunks([text]))
    }
}

/// Reason phrase for a status code
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Headers the writer manages itself
const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "transfer-encoding", "server", "date"];

/// Writes one response to a connection.
///
/// Headers go out with the first body write (or on close for empty
/// bodies). Without a `Content-Length` the body is either chunked (on a
/// reused HTTP/1.1 connection) or delimited by closing the connection.
pub struct ResponseWriter<'a, W: AsyncWrite + Unpin + Send + ?Sized> {
    conn: &'a mut W,
    version: String,
    status: u16,
    headers: Vec<(String, String)>,
    content_length: Option<u64>,
    keep_alive: bool,
    chunked: bool,
    headers_sent: bool,
    response_length: u64,
}

impl<'a, W: AsyncWrite + Unpin + Send + ?Sized> ResponseWriter<'a, W> {
    /// Create a writer answering a request made with `version`
    pub fn new(conn: &'a mut W, version: &str, keep_alive: bool) -> Self {
        Self {
            conn,
            version: version.to_string(),
            status: 200,
            headers: Vec::new(),
            content_length: None,
            keep_alive,
            chunked: false,
            headers_sent: false,
            response_length: 0,
        }
    }

    /// Close the connection after this response, whatever the client asked
    pub fn force_close(&mut self) {
        self.keep_alive = false;
    }

    /// Check if the connection must be closed after this response
    pub fn should_close(&self) -> bool {
        !self.keep_alive
    }

    /// Record status and headers; nothing is written yet
    pub fn start(&mut self, status: u16, headers: Vec<(String, String)>) -> Result<(), CycleError> {
        if self.headers_sent {
            return Err(CycleError::Application(
                "response already started".to_string(),
            ));
        }
        self.content_length = None;
        for (name, value) in &headers {
            if name.eq_ignore_ascii_case("content-length") {
                let len = value.trim().parse().map_err(|_| {
                    CycleError::Application(format!("invalid Content-Length: {:?}", value))
                })?;
                self.content_length = Some(len);
            }
        }
        self.status = status;
        self.headers = headers
            .into_iter()
            .filter(|(name, _)| !HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()))
            .collect();
        Ok(())
    }

    /// Status code of the response
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Headers set by the application
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Check if the status line and headers were written
    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Body bytes written so far
    pub fn response_length(&self) -> u64 {
        self.response_length
    }

    /// Write one body chunk
    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.send_headers().await?;
        if chunk.is_empty() {
            return Ok(());
        }

        let chunk = match self.content_length {
            Some(limit) => {
                let remaining = limit.saturating_sub(self.response_length);
                let take = (chunk.len() as u64).min(remaining) as usize;
                &chunk[..take]
            }
            None => chunk,
        };
        if chunk.is_empty() {
            return Ok(());
        }

        if self.chunked {
            self.conn
                .write_all(format!("{:X}\r\n", chunk.len()).as_bytes())
                .await?;
            self.conn.write_all(chunk).await?;
            self.conn.write_all(b"\r\n").await?;
        } else {
            self.conn.write_all(chunk).await?;
        }
        self.response_length += chunk.len() as u64;
        Ok(())
    }

    /// Send a file through the bulk path
    pub async fn write_file(&mut self, body: &mut FileBody) -> io::Result<u64> {
        if self.content_length.is_none() {
            if let Some(len) = body.len {
                self.content_length = Some(len);
                self.headers.push(("Content-Length".to_string(), len.to_string()));
            }
        }
        self.send_headers().await?;

        if self.chunked {
            // No known length on a reused connection: fall back to chunk framing
            let mut buf = vec![0u8; 64 * 1024];
            let mut total = 0;
            loop {
                let n = tokio::io::AsyncReadExt::read(&mut body.file, &mut buf).await?;
                if n == 0 {
                    break;
                }
                self.write(&buf[..n]).await?;
                total += n as u64;
            }
            return Ok(total);
        }

        let copied = match self.content_length {
            Some(len) => {
                let mut limited = tokio::io::AsyncReadExt::take(&mut body.file, len);
                tokio::io::copy(&mut limited, &mut *self.conn).await?
            }
            None => tokio::io::copy(&mut body.file, &mut *self.conn).await?,
        };
        self.response_length += copied;
        Ok(copied)
    }

    /// Finish the response and flush it
    pub async fn close(&mut self) -> io::Result<()> {
        self.send_headers().await?;
        if self.chunked {
            self.conn.write_all(b"0\r\n\r\n").await?;
        }
        self.conn.flush().await
    }

    async fn send_headers(&mut self) -> io::Result<()> {
        if self.headers_sent {
            return Ok(());
        }

        // Without a length, only chunk framing lets the connection live on
        if self.content_length.is_none() {
            if self.keep_alive && self.version == "HTTP/1.1" && !bodiless(self.status) {
                self.chunked = true;
            } else if !bodiless(self.status) {
                self.keep_alive = false;
            }
        }

        let mut head = format!(
            "{} {} {}\r\n",
            if self.version == "HTTP/1.0" { "HTTP/1.0" } else { "HTTP/1.1" },
            self.status,
            reason_phrase(self.status)
        );
        head.push_str(&format!("Server: {}\r\n", SERVER_SOFTWARE));
        head.push_str(&format!(
            "Date: {}\r\n",
            Utc::now().format("%a, %d %b %Y %H:%M:%S GMT")
        ));
        head.push_str(if self.keep_alive {
            "Connection: keep-alive\r\n"
        } else {
            "Connection: close\r\n"
        });
        if self.chunked {
            head.push_str("Transfer-Encoding: chunked\r\n");
        }
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");

        self.headers_sent = true;
        self.conn.write_all(head.as_bytes()).await
    }
}

fn bodiless(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(buf: &[u8]) -> String {
        String::from_utf8_lossy(buf).to_string()
    }

    #[tokio::test]
    async fn test_close_delimited_response() {
        let mut out = Vec::new();
        let mut writer = ResponseWriter::new(&mut out, "HTTP/1.1", true);
        writer.force_close();
        writer.start(200, vec![("Content-Type".into(), "text/plain".into())]).unwrap();
        writer.write(b"hello ").await.unwrap();
        writer.write(b"world").await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(writer.response_length(), 11);

        let raw = text(&out);
        assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(raw.contains("Connection: close\r\n"));
        assert!(!raw.contains("Transfer-Encoding"));
        assert!(raw.ends_with("\r\n\r\nhello world"));
    }

    #[tokio::test]
    async fn test_chunked_keep_alive_response() {
        let mut out = Vec::new();
        let mut writer = ResponseWriter::new(&mut out, "HTTP/1.1", true);
        writer.start(200, vec![]).unwrap();
        writer.write(b"abc").await.unwrap();
        writer.close().await.unwrap();
        assert!(!writer.should_close());

        let raw = text(&out);
        assert!(raw.contains("Connection: keep-alive\r\n"));
        assert!(raw.contains("Transfer-Encoding: chunked\r\n"));
        assert!(raw.ends_with("\r\n\r\n3\r\nabc\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_content_length_truncates_excess() {
        let mut out = Vec::new();
        let mut writer = ResponseWriter::new(&mut out, "HTTP/1.1", true);
        writer.start(200, vec![("Content-Length".into(), "4".into())]).unwrap();
        writer.write(b"abcdef").await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(writer.response_length(), 4);
        assert!(text(&out).ends_with("\r\n\r\nabcd"));
    }

    #[tokio::test]
    async fn test_hop_by_hop_headers_dropped() {
        let mut out = Vec::new();
        let mut writer = ResponseWriter::new(&mut out, "HTTP/1.0", false);
        writer
            .start(204, vec![("Connection".into(), "upgrade".into()), ("X-Id".into(), "7".into())])
            .unwrap();
        writer.close().await.unwrap();

        let raw = text(&out);
        assert!(raw.starts_with("HTTP/1.0 204 No Content\r\n"));
        assert!(raw.contains("X-Id: 7\r\n"));
        assert!(!raw.contains("upgrade"));
    }

    #[tokio::test]
    async fn test_start_after_headers_sent_fails() {
        let mut out = Vec::new();
        let mut writer = ResponseWriter::new(&mut out, "HTTP/1.1", false);
        writer.write(b"x").await.unwrap();
        assert!(writer.start(500, vec![]).is_err());
    }

    #[tokio::test]
    async fn test_chunked_body_drains_in_order() {
        let mut body = ChunkedBody::new(["a", "bb", "ccc"]);
        assert_eq!(body.len(), 6);
        let mut seen = Vec::new();
        while let Some(chunk) = body.next_chunk().await {
            seen.push(chunk.unwrap());
        }
        assert_eq!(seen, vec!["a", "bb", "ccc"]);
        assert!(body.is_empty());
    }
}
