//! Configuration loading and file-serving tests

use gantry_core::{GantryConfig, Heartbeat, WorkerClass, WorkerConfig};
use gantry_tests::common::{self, FakeProbe, RecordingLogger};
use gantry_worker::app::{self, FileApp};
use gantry_worker::{SyncWorker, WorkerServices};
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_load_file_then_environment() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[worker]
worker_class = "cooperative"
max_requests = 100
graceful_timeout = 7

[server]
bind = "127.0.0.1:9000"

[logging]
level = "debug"
disable_access_log = true
"#
    )
    .unwrap();

    // Only this test touches the environment in this binary
    std::env::set_var("GANTRY_MAX_REQUESTS", "250");
    std::env::set_var("GANTRY_BIND", "127.0.0.1:9100");
    let config = GantryConfig::load(Some(file.path()));
    std::env::remove_var("GANTRY_MAX_REQUESTS");
    std::env::remove_var("GANTRY_BIND");

    let config = config.unwrap();
    assert_eq!(config.worker.worker_class, WorkerClass::Cooperative);
    assert_eq!(config.worker.max_requests, 250);
    assert_eq!(config.worker.graceful_timeout(), Duration::from_secs(7));
    assert_eq!(config.server.bind, "127.0.0.1:9100");
    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.disable_access_log);
}

#[test]
fn test_missing_file_is_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = GantryConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, gantry_core::Error::Configuration(_)));
}

#[test]
fn test_file_app_served_by_sync_worker() {
    common::init();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"served from disk\n").unwrap();

    let (listener, addr) = common::loopback_listener();
    let logger = Arc::new(RecordingLogger::default());
    let application = FileApp::new(file.path()).with_content_type("text/plain");
    let services = WorkerServices::new(Arc::new(application)).with_logger(logger.clone());
    let worker = SyncWorker::new(
        WorkerConfig {
            poll_interval_ms: 50,
            ..Default::default()
        },
        Heartbeat::new().unwrap(),
        services,
        Arc::new(FakeProbe::new(1)),
    );
    let state = Arc::clone(worker.state());
    let handle = thread::spawn(move || worker.run(&listener));

    let response = common::raw_request(addr, b"GET /file HTTP/1.0\r\n\r\n");
    assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
    assert!(response.contains("Content-Type: text/plain\r\n"));
    assert_eq!(common::body_of(&response), "served from disk\n");

    state.stop();
    handle.join().unwrap().unwrap();

    let records = logger.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].response_length, 17);
}

#[test]
fn test_builtin_lookup() {
    assert!(app::builtin("hello").is_some());
    assert!(app::builtin("file:/tmp/anything").is_some());
    assert!(app::builtin("nope").is_none());
}
