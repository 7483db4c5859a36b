//! End-to-end tests for the cooperative worker

use gantry_core::{Heartbeat, WorkerClass, WorkerConfig};
use gantry_tests::common::{self, CapturedEvents, FakeProbe, RecordingLogger};
use gantry_worker::app::{HelloApp, SleepApp};
use gantry_worker::{CooperativeWorker, Strategy, WorkerServices};
use std::net::SocketAddr;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::Level;

fn config(graceful_timeout: u64) -> WorkerConfig {
    WorkerConfig {
        worker_class: WorkerClass::Cooperative,
        worker_connections: 16,
        graceful_timeout,
        poll_interval_ms: 20,
        ..Default::default()
    }
}

fn spawn_worker(
    worker: CooperativeWorker,
    listener: std::net::TcpListener,
) -> mpsc::Receiver<gantry_core::Result<()>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = worker.run(&listener);
        let _ = tx.send(result);
    });
    rx
}

fn spawn_client(addr: SocketAddr, raw: &'static [u8]) -> thread::JoinHandle<String> {
    thread::spawn(move || common::raw_request(addr, raw))
}

/// Like `spawn_worker`, with the worker thread's events going to `events`
fn spawn_captured(
    worker: CooperativeWorker,
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
fn test_serves_connections_concurrently() {
    common::init();
    let (listener, addr) = common::loopback_listener();
    let logger = Arc::new(RecordingLogger::default());
    let services = WorkerServices::new(Arc::new(SleepApp::new(0))).with_logger(logger.clone());
    let worker = CooperativeWorker::new(
        config(30),
        Heartbeat::new().unwrap(),
        services,
        Arc::new(FakeProbe::new(1)),
    );
    let state = Arc::clone(worker.state());
    let done = spawn_worker(worker, listener);

    let started = Instant::now();
    let clients: Vec<_> = (0..4)
        .map(|_| spawn_client(addr, b"GET /sleep?ms=300 HTTP/1.1\r\n\r\n"))
        .collect();
    for client in clients {
        let response = client.join().unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    }
    // Four sequential sleeps would take at least 1.2s
    assert!(started.elapsed() < Duration::from_millis(1100));

    state.stop();
    done.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(logger.records().len(), 4);
    assert_eq!(state.nr(), 4);
}

#[test]
fn test_graceful_stop_waits_for_in_flight_request() {
    common::init();
    let (listener, addr) = common::loopback_listener();
    let logger = Arc::new(RecordingLogger::default());
    let services = WorkerServices::new(Arc::new(SleepApp::new(0))).with_logger(logger.clone());
    let worker = CooperativeWorker::new(
        config(10),
        Heartbeat::new().unwrap(),
        services,
        Arc::new(FakeProbe::new(1)),
    );
    let state = Arc::clone(worker.state());
    let done = spawn_worker(worker, listener);

    let client = spawn_client(addr, b"GET /sleep?ms=300 HTTP/1.1\r\n\r\n");
    assert!(common::wait_for(Duration::from_secs(5), || state.nr() == 1));

    let stopped_at = Instant::now();
    state.stop();
    done.recv_timeout(Duration::from_secs(15)).unwrap().unwrap();

    // Shutdown follows the request, not the ten second budget
    assert!(stopped_at.elapsed() < Duration::from_secs(3));
    let response = client.join().unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(logger.records().len(), 1);
    assert!(logger.errors().is_empty());
}

#[test]
fn test_graceful_timeout_cancels_connections() {
    common::init();
    let (listener, addr) = common::loopback_listener();
    let logger = Arc::new(RecordingLogger::default());
    let services = WorkerServices::new(Arc::new(SleepApp::new(0))).with_logger(logger.clone());
    let worker = CooperativeWorker::new(
        config(0),
        Heartbeat::new().unwrap(),
        services,
        Arc::new(FakeProbe::new(1)),
    );
    let state = Arc::clone(worker.state());
    let done = spawn_worker(worker, listener);

    let client = spawn_client(addr, b"GET /sleep?ms=30000 HTTP/1.1\r\n\r\n");
    assert!(common::wait_for(Duration::from_secs(5), || state.nr() == 1));

    let stopped_at = Instant::now();
    state.stop();
    done.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
    assert!(stopped_at.elapsed() < Duration::from_secs(3));

    // The connection is dropped without a response and without an error report
    let response = client.join().unwrap();
    assert!(response.is_empty());
    assert!(logger.records().is_empty());
    assert!(logger.errors().is_empty());
}

#[test]
fn test_max_requests_stops_accepting_immediately() {
    common::init();
    let (listener, addr) = common::loopback_listener();
    let logger = Arc::new(RecordingLogger::default());
    let services = WorkerServices::new(Arc::new(HelloApp)).with_logger(logger.clone());
    // A long poll interval: only the accept loop itself can notice the limit in time
    let worker = CooperativeWorker::new(
        WorkerConfig {
            max_requests: 1,
            poll_interval_ms: 1000,
            ..config(5)
        },
        Heartbeat::new().unwrap(),
        services,
        Arc::new(FakeProbe::new(1)),
    );
    let state = Arc::clone(worker.state());
    let done = spawn_worker(worker, listener);

    let first = common::raw_request(addr, b"GET /first HTTP/1.1\r\n\r\n");
    assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(!state.is_alive());

    // Sent straight after the limit was hit: closed without a response
    for _ in 0..2 {
        let late = common::try_request(addr, b"GET /late HTTP/1.1\r\n\r\n", Duration::from_secs(2))
            .unwrap_or_default();
        assert!(!late.starts_with("HTTP/1.1 200"));
    }

    done.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(state.nr(), 1);
    assert_eq!(logger.records().len(), 1);
}

#[test]
fn test_parent_exit_stops_worker() {
    common::init();
    let (listener, _addr) = common::loopback_listener();
    let probe = Arc::new(FakeProbe::new(4242));
    let worker = CooperativeWorker::new(
        config(1),
        Heartbeat::new().unwrap(),
        WorkerServices::new(Arc::new(HelloApp)),
        probe.clone(),
    );
    let monitor = worker.heartbeat().clone();
    let events = CapturedEvents::default();
    let done = spawn_captured(worker, listener, events.clone());

    assert!(common::wait_for(Duration::from_secs(5), || monitor.tick() > 2));
    assert!(done.try_recv().is_err());

    let changed_at = Instant::now();
    probe.reparent(1);
    done.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert!(changed_at.elapsed() < Duration::from_secs(1));
    assert!(events.contains(Level::INFO, "Parent changed, shutting down"));
}

#[test]
fn test_protocol_server_keeps_connection_alive() {
    common::init();
    let (listener, addr) = common::loopback_listener();
    let logger = Arc::new(RecordingLogger::default());
    let services = WorkerServices::new(Arc::new(HelloApp)).with_logger(logger.clone());
    let worker = CooperativeWorker::new(
        config(5),
        Heartbeat::new().unwrap(),
        services,
        Arc::new(FakeProbe::new(1)),
    )
    .with_strategy(Strategy::http());
    let state = Arc::clone(worker.state());
    let done = spawn_worker(worker, listener);

    let response = common::raw_request(
        addr,
        b"GET /first HTTP/1.1\r\nHost: test\r\n\r\nGET /second HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(response.matches("HTTP/1.1 200 OK\r\n").count(), 2);
    assert_eq!(response.matches("Hello, World!\n").count(), 2);

    state.stop();
    done.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

    let records = logger.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].path, "/first");
    assert_eq!(records[1].path, "/second");
}
