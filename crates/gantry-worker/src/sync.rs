//! Sync worker
//!
//! Serves one connection at a time from a blocking `accept()`. The worker
//! parks its heartbeat on the sleep sentinel while waiting, so a monitor
//! never mistakes an idle worker for a hung one. The listener carries a
//! receive timeout of one poll interval: an idle accept then fails with
//! `EAGAIN`, and only then is the parent checked.

use gantry_core::{Error, Heartbeat, Result, WorkerConfig};
use gantry_telemetry::{log_parent_changed, log_worker_booted, log_worker_exiting, GantryMetrics};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{setsockopt, sockopt};
use nix::sys::time::{TimeVal, TimeValLike};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cycle::{RequestCycle, WorkerServices};
use crate::liveness::ProcessProbe;
use crate::server::is_transient_accept_error;
use crate::state::WorkerState;

/// A blocking listener the sync worker can drive
pub trait Acceptor {
    /// Put the listener in blocking mode with an accept timeout
    fn prepare(&self, accept_timeout: Duration) -> io::Result<()>;

    /// Block until a connection arrives or the timeout fires
    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;

    /// Address the listener is bound to
    fn local_addr(&self) -> Option<SocketAddr>;
}

impl Acceptor for TcpListener {
    fn prepare(&self, accept_timeout: Duration) -> io::Result<()> {
        self.set_nonblocking(false)?;
        let timeout = TimeVal::milliseconds(accept_timeout.as_millis().max(1) as i64);
        setsockopt(self, sockopt::ReceiveTimeout, &timeout).map_err(io::Error::from)
    }

    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        TcpListener::local_addr(self).ok()
    }
}

/// Worker serving one connection at a time
pub struct SyncWorker {
    config: WorkerConfig,
    heartbeat: Heartbeat,
    state: Arc<WorkerState>,
    cycle: RequestCycle,
    probe: Arc<dyn ProcessProbe>,
}

impl SyncWorker {
    /// Create a worker whose parent is the probe's current parent
    pub fn new(
        config: WorkerConfig,
        heartbeat: Heartbeat,
        services: WorkerServices,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        let state = Arc::new(WorkerState::new(&config, probe.parent_pid()));
        let cycle = RequestCycle::new(services, Arc::clone(&state));
        Self {
            config,
            heartbeat,
            state,
            cycle,
            probe,
        }
    }

    /// Worker state
    pub fn state(&self) -> &Arc<WorkerState> {
        &self.state
    }

    /// Heartbeat ticked by this worker
    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    /// Run until the worker stops, the parent changes or accept fails hard.
    ///
    /// The listener is borrowed; the caller keeps it open.
    pub fn run<L: Acceptor>(&self, listener: &L) -> Result<()> {
        listener.prepare(self.config.poll_interval())?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Runtime(e.to_string()))?;

        let _span = gantry_telemetry::logging::WorkerLogContext::new(
            self.state.worker_id(),
            self.state.worker_class().as_str(),
            self.state.ppid(),
        )
        .span()
        .entered();
        log_worker_booted!(self.state.worker_id(), self.state.worker_class());

        while self.state.is_alive() {
            let accepted = self.accept_and_handle(listener, &runtime);
            // Never leave the heartbeat parked on the sleep sentinel
            self.heartbeat.notify();
            GantryMetrics::record_worker_heartbeat(self.state.worker_id());

            match accepted {
                // Keep serving while connections are waiting
                Ok(()) => continue,
                Err(e) if is_transient_accept_error(&e) => {}
                Err(e) => return Err(Error::Accept(e)),
            }

            if self.probe.parent_pid() != self.state.ppid() {
                log_parent_changed!(self.state.worker_id(), self.state.ppid());
                return Ok(());
            }
        }

        log_worker_exiting!(self.state.worker_id(), self.state.nr());
        Ok(())
    }

    fn accept_and_handle<L: Acceptor>(
        &self,
        listener: &L,
        runtime: &tokio::runtime::Runtime,
    ) -> io::Result<()> {
        self.heartbeat.sleep();
        let (stream, peer) = listener.accept()?;
        self.heartbeat.notify();

        fcntl(&stream, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(io::Error::from)?;
        // The request cycle runs on the runtime and needs a non-blocking socket
        stream.set_nonblocking(true)?;

        let server = listener.local_addr();
        runtime.block_on(async {
            match tokio::net::TcpStream::from_std(stream) {
                Ok(stream) => {
                    let outcome = self.cycle.handle(stream, Some(peer), server).await;
                    debug!(peer = %peer, outcome = outcome.as_str(), "Connection finished");
                }
                Err(e) => warn!(peer = %peer, error = %e, "Failed to register connection"),
            }
        });
        Ok(())
    }
}
