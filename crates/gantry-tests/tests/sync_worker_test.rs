//! End-to-end tests for the sync worker

use async_trait::async_trait;
use gantry_core::{AppResponse, Body, Environ, Heartbeat, Request, WorkerConfig};
use gantry_tests::common::{self, CapturedEvents, FakeProbe, RecordingLogger};
use gantry_worker::{AppError, Application, SyncWorker, WorkerServices};
use std::net::TcpStream;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::Level;

/// Answers with a three-chunk body
struct ThreeChunks;

#[async_trait]
impl Application for ThreeChunks {
    async fn call(&self, _request: &Request, _environ: &Environ) -> Result<AppResponse, AppError> {
        Ok(AppResponse::new(200)
            .header("Content-Type", "text/plain")
            .body(Body::from_chunks(["alpha-", "beta-", "gamma"])))
    }
}

fn config(max_requests: u64) -> WorkerConfig {
    WorkerConfig {
        max_requests,
        poll_interval_ms: 50,
        ..Default::default()
    }
}

fn spawn_worker(
    worker: SyncWorker,
    listener: std::net::TcpListener,
) -> mpsc::Receiver<gantry_core::Result<()>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = worker.run(&listener);
        let _ = tx.send(result);
    });
    rx
}

/// Like `spawn_worker`, with the worker thread's events going to `events`
fn spawn_captured(
    worker: SyncWorker,
    listener: std::net::TcpListener,
    events: CapturedEvents,
) -> mpsc::Receiver<gantry_core::Result<()>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = events.run(|| worker.run(&listener));
        let _ = tx.send(result);
    });
    rx
}

#[test]
fn test_chunked_response_logged_once() {
    common::init();
    let (listener, addr) = common::loopback_listener();
    let logger = Arc::new(RecordingLogger::default());
    let services = WorkerServices::new(Arc::new(ThreeChunks)).with_logger(logger.clone());
    let worker = SyncWorker::new(
        config(0),
        Heartbeat::new().unwrap(),
        services,
        Arc::new(FakeProbe::new(1)),
    );
    let state = Arc::clone(worker.state());
    let done = spawn_worker(worker, listener);

    let response = common::raw_request(addr, b"GET /chunks HTTP/1.1\r\nHost: test\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(common::body_of(&response), "alpha-beta-gamma");

    state.stop();
    done.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

    let records = logger.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, 200);
    assert_eq!(records[0].response_length, ("alpha-".len() + "beta-".len() + "gamma".len()) as u64);
    assert!(logger.errors().is_empty());
}

#[test]
fn test_silent_connection_leaves_no_trace() {
    common::init();
    let (listener, addr) = common::loopback_listener();
    let logger = Arc::new(RecordingLogger::default());
    let services =
        WorkerServices::new(Arc::new(gantry_worker::app::HelloApp)).with_logger(logger.clone());
    let worker = SyncWorker::new(
        config(0),
        Heartbeat::new().unwrap(),
        services,
        Arc::new(FakeProbe::new(1)),
    );
    let state = Arc::clone(worker.state());
    let done = spawn_worker(worker, listener);

    // Connect and hang up without sending anything
    drop(TcpStream::connect(addr).unwrap());

    // Connections are served in order, so this one runs after the silent one
    let response = common::raw_request(addr, b"GET / HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));

    state.stop();
    done.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

    assert_eq!(logger.records().len(), 1);
    assert!(logger.errors().is_empty());
    assert_eq!(state.nr(), 1);
}

#[test]
fn test_parent_change_ends_run_loop() {
    common::init();
    let (listener, _addr) = common::loopback_listener();
    let probe = Arc::new(FakeProbe::new(4242));
    let worker = SyncWorker::new(
        config(0),
        Heartbeat::new().unwrap(),
        WorkerServices::new(Arc::new(gantry_worker::app::HelloApp)),
        probe.clone(),
    );
    let monitor = worker.heartbeat().clone();
    assert_eq!(worker.state().ppid(), 4242);
    let events = CapturedEvents::default();
    let done = spawn_captured(worker, listener, events.clone());

    // Idle worker keeps looping and reads as healthy
    thread::sleep(Duration::from_millis(150));
    assert!(done.try_recv().is_err());
    assert!(!monitor.is_stale(Duration::from_secs(1)));

    let changed_at = Instant::now();
    probe.reparent(1);
    done.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert!(changed_at.elapsed() < Duration::from_secs(1));
    assert!(events.contains(Level::INFO, "Parent changed, shutting down"));
}

#[test]
fn test_max_requests_ends_run_loop() {
    common::init();
    let (listener, addr) = common::loopback_listener();
    let worker = SyncWorker::new(
        config(2),
        Heartbeat::new().unwrap(),
        WorkerServices::new(Arc::new(gantry_worker::app::HelloApp)),
        Arc::new(FakeProbe::new(1)),
    );
    let state = Arc::clone(worker.state());
    let done = spawn_worker(worker, listener);

    for _ in 0..2 {
        let response = common::raw_request(addr, b"GET / HTTP/1.1\r\n\r\n");
        assert!(response.contains("Connection: close\r\n"));
    }

    done.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(state.nr(), 2);
    assert!(!state.is_alive());
}
