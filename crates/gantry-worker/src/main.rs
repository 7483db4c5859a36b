//! Gantry Worker - Main entry point

use anyhow::{bail, Context, Result};
use clap::Parser;
use gantry_core::{GantryConfig, Heartbeat, WorkerClass};
use gantry_telemetry::{init_logging, GantryMetrics, LogFormat, LoggingConfig, MetricsConfig, TracingAccessLog};
use gantry_worker::cooperative::{CooperativeWorker, Strategy};
use gantry_worker::hooks::TracingHooks;
use gantry_worker::{app, signals, OsProbe, SyncWorker, WorkerServices};
use std::net::TcpListener;
use std::os::fd::FromRawFd;
use std::sync::Arc;
use tracing::info;

/// Gantry Worker - supervised request-processing worker
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "GANTRY_CONFIG")]
    config: Option<String>,

    /// Address to bind when no socket is inherited
    #[arg(short, long)]
    bind: Option<String>,

    /// Inherited listening socket descriptor
    #[arg(long)]
    fd: Option<i32>,

    /// Worker kind (sync, cooperative)
    #[arg(short = 'k', long)]
    worker_class: Option<WorkerClass>,

    /// Requests served before the worker restarts itself (0 = unlimited)
    #[arg(long)]
    max_requests: Option<u64>,

    /// Concurrent connections for the cooperative worker
    #[arg(long)]
    worker_connections: Option<usize>,

    /// Seconds to wait for in-flight connections on shutdown
    #[arg(long)]
    graceful_timeout: Option<u64>,

    /// Seconds to wait for a request on an idle connection
    #[arg(long)]
    keepalive: Option<u64>,

    /// Built-in application (hello, echo, sleep, fail, file:PATH)
    #[arg(long, default_value = "hello", env = "GANTRY_APP")]
    app: String,

    /// Serve with the keep-alive HTTP server (cooperative worker only)
    #[arg(long)]
    protocol_server: bool,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (json, pretty, compact)
    #[arg(long)]
    log_format: Option<LogFormat>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration, then override with CLI args
    let mut config = GantryConfig::load(args.config.as_deref())?;

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(fd) = args.fd {
        config.server.fd = Some(fd);
    }
    if let Some(worker_class) = args.worker_class {
        config.worker.worker_class = worker_class;
    }
    if let Some(max_requests) = args.max_requests {
        config.worker.max_requests = max_requests;
    }
    if let Some(worker_connections) = args.worker_connections {
        config.worker.worker_connections = worker_connections;
    }
    if let Some(graceful_timeout) = args.graceful_timeout {
        config.worker.graceful_timeout = graceful_timeout;
    }
    if let Some(keepalive) = args.keepalive {
        config.worker.keepalive = keepalive;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    // Initialize logging
    let mut logging = LoggingConfig::from_core(&config.logging)?;
    if let Some(format) = args.log_format {
        logging.format = format;
    }
    init_logging(logging)?;

    let _metrics = GantryMetrics::new(MetricsConfig::from(&config.telemetry))?;
    signals::install_stop_handlers()?;

    info!("Starting Gantry Worker v{}", env!("CARGO_PKG_VERSION"));

    let listener = match config.server.fd {
        Some(fd) => {
            info!("Using inherited socket fd {}", fd);
            // SAFETY: the supervisor hands over an open listening socket.
            unsafe { TcpListener::from_raw_fd(fd) }
        }
        None => {
            info!("Listening at: http://{}", config.server.bind);
            TcpListener::bind(&config.server.bind)
                .with_context(|| format!("failed to bind {}", config.server.bind))?
        }
    };

    let application = match app::builtin(&args.app) {
        Some(application) => application,
        None => bail!("unknown application: {}", args.app),
    };
    let services = WorkerServices::new(application)
        .with_parser(Arc::new(gantry_core::HttpParser::from_config(&config.worker)))
        .with_hooks(Arc::new(TracingHooks))
        .with_logger(Arc::new(TracingAccessLog::from_config(&config.logging)));

    let heartbeat = Heartbeat::new()?;
    let probe = Arc::new(OsProbe);

    match config.worker.worker_class {
        WorkerClass::Sync => {
            if args.protocol_server {
                bail!("--protocol-server requires the cooperative worker");
            }
            SyncWorker::new(config.worker.clone(), heartbeat, services, probe).run(&listener)?;
        }
        WorkerClass::Cooperative => {
            let strategy = if args.protocol_server {
                Strategy::http()
            } else {
                Strategy::default()
            };
            CooperativeWorker::new(config.worker.clone(), heartbeat, services, probe)
                .with_strategy(strategy)
                .run(&listener)?;
        }
    }

    info!("Gantry Worker stopped");
    Ok(())
}
