//! Gantry Worker - Supervised request-processing worker
//!
//! This crate provides the worker process run under a supervisor:
//! - The request cycle shared by both worker kinds
//! - A sync worker serving one connection at a time
//! - A cooperative worker multiplexing connections on one thread
//! - Heartbeat ticking, parent watching and graceful shutdown

pub mod app;
pub mod cooperative;
pub mod cycle;
pub mod hooks;
pub mod liveness;
pub mod server;
pub mod signals;
pub mod state;
pub mod sync;

pub use app::{AppError, Application};
pub use cooperative::{ConnectionPool, CooperativeWorker, Strategy};
pub use cycle::{ConnectionHandler, CycleOutcome, RequestCycle, RequestLogger, WorkerServices};
pub use hooks::WorkerHooks;
pub use liveness::{OsProbe, ProcessProbe};
pub use server::{HttpServer, ProtocolServer, ServeContext, StreamServer};
pub use state::WorkerState;
pub use sync::SyncWorker;
