//! Cooperative worker
//!
//! Many connections multiplexed on one current-thread runtime. The control
//! loop ticks the heartbeat and watches the parent; the connection server
//! runs as a background task. On shutdown the server stops accepting,
//! in-flight connections get up to `graceful_timeout` to finish, and
//! whatever is left is cancelled.

use gantry_core::config::MAX_WORKER_CONNECTIONS;
use gantry_core::{Error, Heartbeat, Result, WorkerConfig};
use gantry_telemetry::{log_parent_changed, log_worker_booted, log_worker_exiting, GantryMetrics};
use nix::sys::signal::{signal, SigHandler, Signal};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

use crate::cycle::{ConnectionHandler, CycleHandler, RequestCycle, WorkerServices};
use crate::liveness::ProcessProbe;
use crate::server::{HttpServer, ProtocolServer, ServeContext, StreamServer};
use crate::state::WorkerState;

static SETUP: OnceLock<()> = OnceLock::new();

/// One-time process setup for cooperative workers.
///
/// Ignores `SIGPIPE` so a vanished peer surfaces as an `EPIPE` write error.
pub fn setup() {
    SETUP.get_or_init(|| {
        // SAFETY: SIG_IGN installs no handler code.
        unsafe {
            signal(Signal::SIGPIPE, SigHandler::SigIgn).ok();
        }
        debug!("Cooperative worker setup complete");
    });
}

/// Bounded set of connection tasks
#[derive(Clone)]
pub struct ConnectionPool {
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    capacity: usize,
}

impl ConnectionPool {
    /// Create a pool running at most `capacity` tasks.
    ///
    /// The capacity is clamped to `1..=MAX_WORKER_CONNECTIONS`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_WORKER_CONNECTIONS);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            tracker: TaskTracker::new(),
            capacity,
        }
    }

    /// Maximum concurrent tasks
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Wait for a free slot; `None` once the pool is closed
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).acquire_owned().await.ok()
    }

    /// Run `task` in the slot held by `permit`
    pub fn spawn<F>(&self, permit: OwnedSemaphorePermit, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(async move {
            task.await;
            drop(permit);
        });
    }

    /// Wait until every slot is free, up to `timeout`.
    ///
    /// Returns as soon as the last task finishes.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        // Clamped in `new`, so the capacity always fits
        let all = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        matches!(
            tokio::time::timeout(timeout, self.semaphore.acquire_many(all)).await,
            Ok(Ok(_))
        )
    }

    /// Stop tracking new tasks and wait for tracked ones to end
    pub async fn close(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// How the cooperative worker handles connections
#[derive(Clone)]
pub enum Strategy {
    /// Built-in stream server calling a handler once per connection
    Raw(Arc<dyn ConnectionHandler>),
    /// A server that owns accepting and protocol handling
    Protocol(Arc<dyn ProtocolServer>),
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Raw(Arc::new(CycleHandler))
    }
}

impl Strategy {
    /// Keep-alive HTTP server
    pub fn http() -> Self {
        Strategy::Protocol(Arc::new(HttpServer))
    }

    fn into_server(self) -> Arc<dyn ProtocolServer> {
        match self {
            Strategy::Raw(handler) => Arc::new(StreamServer::new(handler)),
            Strategy::Protocol(server) => server,
        }
    }
}

/// Worker multiplexing connections on cooperative tasks
pub struct CooperativeWorker {
    config: WorkerConfig,
    heartbeat: Heartbeat,
    state: Arc<WorkerState>,
    services: WorkerServices,
    probe: Arc<dyn ProcessProbe>,
    strategy: Strategy,
}

impl CooperativeWorker {
    /// Create a worker whose parent is the probe's current parent
    pub fn new(
        config: WorkerConfig,
        heartbeat: Heartbeat,
        services: WorkerServices,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        let state = Arc::new(WorkerState::new(&config, probe.parent_pid()));
        Self {
            config,
            heartbeat,
            state,
            services,
            probe,
            strategy: Strategy::default(),
        }
    }

    /// Choose the connection strategy
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Worker state
    pub fn state(&self) -> &Arc<WorkerState> {
        &self.state
    }

    /// Heartbeat ticked by this worker
    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    /// Run on a fresh current-thread runtime until the worker stops.
    ///
    /// The listener stays owned by the caller; the worker serves a duplicate.
    pub fn run(&self, listener: &std::net::TcpListener) -> Result<()> {
        setup();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Runtime(e.to_string()))?;
        runtime.block_on(self.run_async(listener))
    }

    /// Run inside an existing runtime
    pub async fn run_async(&self, listener: &std::net::TcpListener) -> Result<()> {
        let listener = listener.try_clone()?;
        listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(listener)?;

        let span = gantry_telemetry::logging::WorkerLogContext::new(
            self.state.worker_id(),
            self.state.worker_class().as_str(),
            self.state.ppid(),
        )
        .span();
        self.serve(listener).instrument(span).await
    }

    async fn serve(&self, listener: tokio::net::TcpListener) -> Result<()> {
        log_worker_booted!(self.state.worker_id(), self.state.worker_class());

        let pool = ConnectionPool::new(self.config.worker_connections);
        let stop_accepting = CancellationToken::new();
        let cancel = CancellationToken::new();
        let cycle = RequestCycle::new(self.services.clone(), Arc::clone(&self.state))
            .with_read_timeout(self.config.keepalive())
            .with_cancellation(cancel.clone());
        let ctx = ServeContext {
            cycle: Arc::new(cycle),
            pool: pool.clone(),
            stop_accepting: stop_accepting.clone(),
        };

        let server = self.strategy.clone().into_server();
        let mut server_task = tokio::spawn(async move { server.serve(listener, ctx).await });
        let mut server_exit = None;

        while self.state.is_alive() {
            self.heartbeat.notify();
            GantryMetrics::record_worker_heartbeat(self.state.worker_id());

            if !self.probe.is_running(self.state.ppid()) {
                log_parent_changed!(self.state.worker_id(), self.state.ppid());
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                exit = &mut server_task => {
                    server_exit = Some(exit);
                    break;
                }
            }
        }

        // Errors on the way down are logged, never raised
        self.heartbeat.notify();
        stop_accepting.cancel();
        if server_exit.is_none() {
            match server_task.await {
                Ok(Err(e)) => debug!(error = %e, "Server stopped with error"),
                Err(e) => debug!(error = %e, "Server task failed"),
                Ok(Ok(())) => {}
            }
        }

        let in_flight = pool.in_flight();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight connections");
        }
        if !pool.wait_idle(self.config.graceful_timeout()).await {
            warn!(
                in_flight = pool.in_flight(),
                "Graceful timeout reached, cancelling connections"
            );
            cancel.cancel();
            if tokio::time::timeout(self.config.poll_interval(), pool.close())
                .await
                .is_err()
            {
                debug!("Abandoning connections that ignored cancellation");
            }
        }

        log_worker_exiting!(self.state.worker_id(), self.state.nr());

        match server_exit {
            Some(Ok(Err(e))) => Err(e),
            Some(Err(e)) => Err(Error::Internal(format!("server task failed: {}", e))),
            _ => Ok(()),
        }
    }
}
