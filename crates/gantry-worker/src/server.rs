//! Connection servers run by the cooperative worker
//!
//! A server owns the accept loop. [`StreamServer`] hands each raw
//! connection to a [`ConnectionHandler`]; [`HttpServer`] keeps connections
//! open across requests.

use async_trait::async_trait;
use gantry_core::{Error, Result};
use gantry_telemetry::metrics::ConnectionGuard;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cooperative::ConnectionPool;
use crate::cycle::{ConnectionHandler, ConnectionMode, CycleOutcome, RequestCycle};
use crate::state::WorkerState;

/// Everything a server needs from the worker that runs it
#[derive(Clone)]
pub struct ServeContext {
    /// Request cycle shared by all connections
    pub cycle: Arc<RequestCycle>,

    /// Bounded pool that runs connection tasks
    pub pool: ConnectionPool,

    /// Cancelled when the server must stop accepting
    pub stop_accepting: CancellationToken,
}

impl ServeContext {
    /// Worker state
    pub fn state(&self) -> &Arc<WorkerState> {
        self.cycle.state()
    }
}

/// A server that owns accepting and serving connections
#[async_trait]
pub trait ProtocolServer: Send + Sync {
    /// Accept and serve until `ctx.stop_accepting` is cancelled
    async fn serve(&self, listener: TcpListener, ctx: ServeContext) -> Result<()>;
}

/// Check if an accept error only means "try again"
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionAborted
    )
}

/// Accept connections and spawn `handle` for each one into the pool.
///
/// A pool slot is taken before accepting, so a full pool stops accepting.
/// Once the worker is no longer alive nothing new is served: a connection
/// accepted after that point is closed unanswered.
pub async fn accept_loop<F, Fut>(listener: &TcpListener, ctx: &ServeContext, handle: F) -> Result<()>
where
    F: Fn(TcpStream, SocketAddr, ServeContext) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    while ctx.state().is_alive() {
        let permit = tokio::select! {
            biased;
            _ = ctx.stop_accepting.cancelled() => break,
            permit = ctx.pool.acquire() => match permit {
                Some(permit) => permit,
                None => break,
            },
        };

        let (conn, peer) = tokio::select! {
            biased;
            _ = ctx.stop_accepting.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) if is_transient_accept_error(&e) => {
                    debug!(error = %e, "Ignoring transient accept error");
                    continue;
                }
                Err(e) => return Err(Error::Accept(e)),
            },
        };

        if !ctx.state().is_alive() {
            debug!(peer = %peer, "Worker stopping, closing new connection");
            drop(conn);
            break;
        }

        let worker_id = ctx.state().worker_id().to_string();
        let task = handle(conn, peer, ctx.clone());
        ctx.pool.spawn(permit, async move {
            let _guard = ConnectionGuard::new(&worker_id);
            task.await;
        });
    }

    debug!("Stopped accepting connections");
    Ok(())
}

/// Serves raw connections through a [`ConnectionHandler`]
pub struct StreamServer {
    handler: Arc<dyn ConnectionHandler>,
}

impl StreamServer {
    /// Create a server for `handler`
    pub fn new(handler: Arc<dyn ConnectionHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl ProtocolServer for StreamServer {
    async fn serve(&self, listener: TcpListener, ctx: ServeContext) -> Result<()> {
        accept_loop(&listener, &ctx, |conn, peer, ctx| {
            let handler = Arc::clone(&self.handler);
            async move {
                let outcome = handler.handle(conn, peer, &ctx.cycle).await;
                debug!(peer = %peer, outcome = outcome.as_str(), "Connection finished");
            }
        })
        .await
    }
}

/// HTTP/1.x server that keeps connections alive between requests
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpServer;

impl HttpServer {
    /// Serve requests on one connection until it should close
    pub async fn serve_connection(conn: TcpStream, peer: SocketAddr, ctx: &ServeContext) -> u64 {
        let server = conn.local_addr().ok();
        let mut conn = BufReader::new(conn);
        let mut served = 0;

        loop {
            let exchange = ctx
                .cycle
                .next(&mut conn, Some(peer), server, ConnectionMode::KeepAlive)
                .await;
            if exchange.outcome == CycleOutcome::Completed {
                served += 1;
            }
            if !exchange.keep_alive
                || !ctx.state().is_alive()
                || ctx.stop_accepting.is_cancelled()
            {
                break;
            }
        }

        if let Err(e) = conn.shutdown().await {
            debug!(error = %e, "Error shutting down connection");
        }
        served
    }
}

#[async_trait]
impl ProtocolServer for HttpServer {
    async fn serve(&self, listener: TcpListener, ctx: ServeContext) -> Result<()> {
        let result = accept_loop(&listener, &ctx, |conn, peer, ctx| async move {
            let served = HttpServer::serve_connection(conn, peer, &ctx).await;
            debug!(peer = %peer, served, "Connection finished");
        })
        .await;
        if let Err(ref e) = result {
            warn!(error = %e, "HTTP server stopped");
        }
        result
    }
}
