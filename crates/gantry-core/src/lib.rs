//! Gantry Core - Core types for the Gantry worker
//!
//! This crate provides the building blocks shared by the worker kinds:
//! - The cross-process heartbeat
//! - Configuration structures
//! - Error types
//! - Request, response and environ types with a minimal HTTP/1.x codec

pub mod access;
pub mod config;
pub mod environ;
pub mod error;
pub mod heartbeat;
pub mod http;
pub mod response;

pub use access::AccessRecord;
pub use config::{GantryConfig, LoggingConfig, ServerConfig, TelemetryConfig, WorkerClass, WorkerConfig};
pub use environ::Environ;
pub use error::{CycleError, Error, Result};
pub use heartbeat::Heartbeat;
pub use http::{HttpParser, Request, RequestParser};
pub use response::{AppResponse, Body, ChunkedBody, FileBody, ResponseBody, ResponseWriter};
