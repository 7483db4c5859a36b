//! Per-process worker state

use gantry_core::{WorkerClass, WorkerConfig};
use gantry_telemetry::GantryMetrics;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::info;

use crate::signals;

/// State shared by a worker's run loop and its request cycles
#[derive(Debug)]
pub struct WorkerState {
    /// Worker ID, `{hostname}@{pid}`
    worker_id: String,

    /// Worker kind
    worker_class: WorkerClass,

    /// Cleared to stop accepting new connections
    alive: AtomicBool,

    /// Requests served so far
    nr: AtomicU64,

    /// Parent PID captured at startup
    ppid: i32,

    /// Requests after which the worker restarts itself
    max_requests: u64,
}

impl WorkerState {
    /// Create state for a worker whose parent is `ppid`
    pub fn new(config: &WorkerConfig, ppid: i32) -> Self {
        Self {
            worker_id: default_worker_id(),
            worker_class: config.worker_class,
            alive: AtomicBool::new(true),
            nr: AtomicU64::new(0),
            ppid,
            max_requests: config.max_requests_limit(),
        }
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Get the worker kind
    pub fn worker_class(&self) -> WorkerClass {
        self.worker_class
    }

    /// Parent PID captured at startup
    pub fn ppid(&self) -> i32 {
        self.ppid
    }

    /// Requests served so far
    pub fn nr(&self) -> u64 {
        self.nr.load(Ordering::SeqCst)
    }

    /// Effective request limit; `u64::MAX` when unlimited
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Check if the worker should keep accepting connections
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !signals::stop_requested()
    }

    /// Stop accepting new connections
    pub fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Count one request and return the new total.
    ///
    /// The request that brings the counter to `max_requests` clears the
    /// liveness flag; it is still served.
    pub fn record_request(&self) -> u64 {
        let nr = self.nr.fetch_add(1, Ordering::SeqCst) + 1;
        if nr >= self.max_requests && self.alive.swap(false, Ordering::SeqCst) {
            info!(
                worker_id = %self.worker_id,
                nr,
                "Autorestarting worker after current request."
            );
            GantryMetrics::worker_autorestart(self.worker_class.as_str());
        }
        nr
    }
}

fn default_worker_id() -> String {
    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{}@{}", hostname, std::process::id())
}
