//! Common test utilities and fixtures

use gantry_core::{AccessRecord, CycleError};
use gantry_worker::{ProcessProbe, RequestLogger};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::fmt;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

static INIT: Once = Once::new();

/// Initialize test environment (logging, etc.)
pub fn init() {
    INIT.call_once(|| {
        // Set up test logging
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("gantry=debug")
            .try_init();
    });
}

/// Tracing layer that keeps the level and message of every event
#[derive(Clone, Default)]
pub struct CapturedEvents {
    events: Arc<Mutex<Vec<(Level, String)>>>,
}

impl CapturedEvents {
    /// Run `f` with events on this thread going to the capture
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let subscriber = tracing_subscriber::registry().with(self.clone());
        tracing::subscriber::with_default(subscriber, f)
    }

    /// Check if an event with this level and message was seen
    pub fn contains(&self, level: Level, message: &str) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|(l, m)| *l == level && m == message)
    }
}

impl<S: Subscriber> Layer<S> for CapturedEvents {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.events
            .lock()
            .unwrap()
            .push((*event.metadata().level(), visitor.message));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}

/// Logger that keeps everything it is given
#[derive(Default)]
pub struct RecordingLogger {
    records: Mutex<Vec<AccessRecord>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingLogger {
    /// Access records seen so far
    pub fn records(&self) -> Vec<AccessRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Errors reported so far
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl RequestLogger for RecordingLogger {
    fn access(&self, record: &AccessRecord) {
        self.records.lock().unwrap().push(record.clone());
    }

    fn exception(&self, msg: &str, err: &CycleError) {
        self.errors.lock().unwrap().push(format!("{}: {}", msg, err));
    }
}

/// Probe whose parent PID and liveness tests can change
pub struct FakeProbe {
    parent: AtomicI32,
    running: AtomicBool,
}

impl FakeProbe {
    /// Probe reporting `parent` as a live parent
    pub fn new(parent: i32) -> Self {
        Self {
            parent: AtomicI32::new(parent),
            running: AtomicBool::new(true),
        }
    }

    /// Simulate being reparented
    pub fn reparent(&self, parent: i32) {
        self.parent.store(parent, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }
}

impl ProcessProbe for FakeProbe {
    fn parent_pid(&self) -> i32 {
        self.parent.load(Ordering::SeqCst)
    }

    fn is_running(&self, _pid: i32) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Loopback listener on an ephemeral port
pub fn loopback_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    (listener, addr)
}

/// Send raw bytes and read until the server closes the connection
pub fn raw_request(addr: SocketAddr, raw: &[u8]) -> String {
    let mut conn = TcpStream::connect(addr).expect("connect");
    conn.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    conn.write_all(raw).expect("write request");
    let mut response = String::new();
    conn.read_to_string(&mut response).expect("read response");
    response
}

/// Like [`raw_request`], but hands back I/O errors such as a reset or a
/// read timeout instead of panicking
pub fn try_request(addr: SocketAddr, raw: &[u8], timeout: Duration) -> std::io::Result<String> {
    let mut conn = TcpStream::connect(addr)?;
    conn.set_read_timeout(Some(timeout))?;
    conn.write_all(raw)?;
    let mut response = String::new();
    conn.read_to_string(&mut response)?;
    Ok(response)
}

/// Body of an HTTP response, after the blank line
pub fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
