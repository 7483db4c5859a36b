//! The request cycle shared by both worker kinds
//!
//! One cycle reads a request, runs the hooks and the application, writes
//! the response and logs the exchange. Failures are classified by
//! [`CycleError`] variant:
//! - end of stream before a request: closed quietly
//! - peer gone while writing: debug note only
//! - other socket errors: reported as "Error processing request."
//! - parse and application errors: handed to [`Application::handle_error`]

use async_trait::async_trait;
use chrono::Utc;
use gantry_core::environ;
use gantry_core::response::ResponseWriter;
use gantry_core::{
    AccessRecord, AppResponse, Body, CycleError, Environ, Request, RequestParser, ResponseBody,
};
use gantry_telemetry::logging::ConnectionLogContext;
use gantry_telemetry::metrics::RequestTimer;
use gantry_telemetry::{log_connection_closed, log_request_failed, TracingAccessLog};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use crate::app::Application;
use crate::hooks::WorkerHooks;
use crate::state::WorkerState;

/// How one request cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Response written and access logged
    Completed,
    /// Connection closed or idled out before a request arrived
    StreamEnded,
    /// Peer went away while the response was being written
    PeerDisconnected,
    /// Request failed and the error was reported
    Failed,
    /// Interrupted by cancellation
    Cancelled,
}

impl CycleOutcome {
    /// Label used in metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Completed => "completed",
            CycleOutcome::StreamEnded => "stream_ended",
            CycleOutcome::PeerDisconnected => "peer_disconnected",
            CycleOutcome::Failed => "failed",
            CycleOutcome::Cancelled => "cancelled",
        }
    }
}

/// Sink for access records and reported errors
pub trait RequestLogger: Send + Sync {
    /// Record a completed exchange
    fn access(&self, record: &AccessRecord);

    /// Report an unexpected error
    fn exception(&self, msg: &str, err: &CycleError);
}

impl RequestLogger for TracingAccessLog {
    fn access(&self, record: &AccessRecord) {
        self.log(record);
    }

    fn exception(&self, msg: &str, err: &CycleError) {
        log_request_failed!(err);
        debug!(error = ?err, "{}", msg);
    }
}

/// Collaborators a worker hands to its request cycles
#[derive(Clone)]
pub struct WorkerServices {
    /// Hosted application
    pub app: Arc<dyn Application>,

    /// Request parser
    pub parser: Arc<dyn RequestParser>,

    /// Server hooks
    pub hooks: Arc<dyn WorkerHooks>,

    /// Access and error logger
    pub logger: Arc<dyn RequestLogger>,
}

impl WorkerServices {
    /// Services with the default parser, no hooks and the tracing access log
    pub fn new(app: Arc<dyn Application>) -> Self {
        Self {
            app,
            parser: Arc::new(gantry_core::HttpParser::default()),
            hooks: Arc::new(crate::hooks::NoopHooks),
            logger: Arc::new(TracingAccessLog::default()),
        }
    }

    /// Replace the parser
    pub fn with_parser(mut self, parser: Arc<dyn RequestParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Replace the hooks
    pub fn with_hooks(mut self, hooks: Arc<dyn WorkerHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Replace the logger
    pub fn with_logger(mut self, logger: Arc<dyn RequestLogger>) -> Self {
        self.logger = logger;
        self
    }
}

/// Whether a connection may serve more than one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Always close after the response
    Close,
    /// Reuse the connection when the client and the worker allow it
    KeepAlive,
}

/// Result of serving one request on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exchange {
    /// How the cycle ended
    pub outcome: CycleOutcome,

    /// Whether the connection can carry another request
    pub keep_alive: bool,
}

impl Exchange {
    fn closed(outcome: CycleOutcome) -> Self {
        Self {
            outcome,
            keep_alive: false,
        }
    }
}

/// Serves requests on accepted connections
pub struct RequestCycle {
    services: WorkerServices,
    state: Arc<WorkerState>,
    read_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl RequestCycle {
    /// Create a cycle for a worker
    pub fn new(services: WorkerServices, state: Arc<WorkerState>) -> Self {
        Self {
            services,
            state,
            read_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Bound every request-head read by `timeout`
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Abort in-flight cycles when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Worker state this cycle reports to
    pub fn state(&self) -> &Arc<WorkerState> {
        &self.state
    }

    /// Serve exactly one request on `conn`, then close it
    pub async fn handle<S>(
        &self,
        conn: S,
        peer: Option<SocketAddr>,
        server: Option<SocketAddr>,
    ) -> CycleOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut conn = BufReader::new(conn);
        let exchange = self
            .next(&mut conn, peer, server, ConnectionMode::Close)
            .instrument(ConnectionLogContext::new(peer, self.state.nr()).span())
            .await;
        let _ = conn.shutdown().await;
        exchange.outcome
    }

    /// Serve the next request on a buffered connection
    pub async fn next<S>(
        &self,
        conn: &mut BufReader<S>,
        peer: Option<SocketAddr>,
        server: Option<SocketAddr>,
        mode: ConnectionMode,
    ) -> Exchange
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut timer = RequestTimer::start(self.state.worker_class().as_str());
        let exchange = self.serve(conn, peer, server, mode).await;
        timer.set_outcome(exchange.outcome.as_str());
        exchange
    }

    async fn serve<S>(
        &self,
        conn: &mut BufReader<S>,
        peer: Option<SocketAddr>,
        server: Option<SocketAddr>,
        mode: ConnectionMode,
    ) -> Exchange
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let read = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CycleError::Cancelled),
            read = self.read_request(conn) => read,
        };
        let request = match read {
            Ok(request) => request,
            Err(err) => return self.fail(conn, None, err, false).await,
        };

        let mut environ = Environ::new();
        let dispatched = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            exchange = self.dispatch(conn, &request, &mut environ, peer, server, mode) => Some(exchange),
        };
        let exchange = match dispatched {
            Some(exchange) => exchange,
            None => {
                self.fail(conn, Some(&request), CycleError::Cancelled, false)
                    .await
            }
        };

        // Runs for every parsed request, cancelled ones included
        if let Err(e) = self
            .services
            .hooks
            .post_request(&self.state, &request, &environ)
            .await
        {
            debug!(error = %e, "post_request hook failed");
        }

        exchange
    }

    async fn read_request<S>(&self, conn: &mut BufReader<S>) -> Result<Request, CycleError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let parse = self.services.parser.parse(conn);
        match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, parse)
                .await
                .map_err(|_| CycleError::Timeout)?,
            None => parse.await,
        }
    }

    async fn dispatch<S>(
        &self,
        conn: &mut BufReader<S>,
        request: &Request,
        environ: &mut Environ,
        peer: Option<SocketAddr>,
        server: Option<SocketAddr>,
        mode: ConnectionMode,
    ) -> Exchange
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if let Err(e) = self.services.hooks.pre_request(&self.state, request).await {
            return self.fail(conn, Some(request), e.into(), false).await;
        }

        let started = Instant::now();
        let timestamp = Utc::now();
        *environ = environ::create(request, peer, server, self.state.worker_class().as_str());

        let keep_alive = mode == ConnectionMode::KeepAlive && request.wants_keep_alive();
        let mut writer = ResponseWriter::new(&mut *conn, &request.version, keep_alive);
        if mode == ConnectionMode::Close {
            writer.force_close();
        }

        self.state.record_request();
        if !self.state.is_alive() {
            writer.force_close();
        }

        let written = match self.services.app.call(request, environ).await {
            Ok(response) => write_response(&mut writer, response).await,
            Err(e) => Err(e.into()),
        };

        let headers_sent = writer.headers_sent();
        match written {
            Ok(()) => {
                let record = AccessRecord {
                    request_line: request.request_line(),
                    method: request.method.clone(),
                    path: request.path.clone(),
                    query: request.query.clone(),
                    status: writer.status(),
                    response_headers: writer.headers().to_vec(),
                    response_length: writer.response_length(),
                    remote_addr: peer,
                    elapsed: started.elapsed(),
                    request_headers: request.headers.clone(),
                    timestamp,
                };
                let keep_alive = !writer.should_close();
                self.services.logger.access(&record);
                Exchange {
                    outcome: CycleOutcome::Completed,
                    keep_alive,
                }
            }
            Err(err) => self.fail(conn, Some(request), err, headers_sent).await,
        }
    }

    async fn fail<S>(
        &self,
        conn: &mut BufReader<S>,
        request: Option<&Request>,
        err: CycleError,
        headers_sent: bool,
    ) -> Exchange
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let outcome = match &err {
            CycleError::StreamEnded | CycleError::Timeout => {
                log_connection_closed!(err);
                CycleOutcome::StreamEnded
            }
            CycleError::Cancelled => {
                debug!("Request cancelled");
                CycleOutcome::Cancelled
            }
            CycleError::PeerReset(e) => {
                debug!(error = %e, "Ignoring peer disconnect");
                CycleOutcome::PeerDisconnected
            }
            CycleError::Io(_) => {
                self.services.logger.exception("Error processing request.", &err);
                CycleOutcome::Failed
            }
            CycleError::Parse(_) | CycleError::Application(_) => {
                self.services
                    .app
                    .handle_error(conn, request, &err, headers_sent)
                    .await;
                CycleOutcome::Failed
            }
        };
        Exchange::closed(outcome)
    }
}

async fn write_response<W>(
    writer: &mut ResponseWriter<'_, W>,
    response: AppResponse,
) -> Result<(), CycleError>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    writer.start(response.status, response.headers)?;
    match response.body {
        Body::File(mut file) => {
            writer.write_file(&mut file).await?;
            writer.close().await?;
            Ok(())
        }
        Body::Chunks(mut body) => {
            let written = write_chunks(writer, body.as_mut()).await;
            body.close().await;
            written
        }
    }
}

async fn write_chunks<W>(
    writer: &mut ResponseWriter<'_, W>,
    body: &mut dyn ResponseBody,
) -> Result<(), CycleError>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    while let Some(chunk) = body.next_chunk().await {
        writer.write(&chunk?).await?;
    }
    writer.close().await?;
    Ok(())
}

/// Handles one raw accepted connection
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// Serve the connection until it should be closed
    async fn handle(
        &self,
        conn: tokio::net::TcpStream,
        peer: SocketAddr,
        cycle: &RequestCycle,
    ) -> CycleOutcome;
}

/// Runs one request cycle per connection
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleHandler;

#[async_trait]
impl ConnectionHandler for CycleHandler {
    async fn handle(
        &self,
        conn: tokio::net::TcpStream,
        peer: SocketAddr,
        cycle: &RequestCycle,
    ) -> CycleOutcome {
        let server = conn.local_addr().ok();
        cycle.handle(conn, Some(peer), server).await
    }
}
