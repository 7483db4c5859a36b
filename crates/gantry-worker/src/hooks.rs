//! Server hooks run around each request

use async_trait::async_trait;
use gantry_core::{Environ, Request};

use crate::app::AppError;
use crate::state::WorkerState;

/// Hooks invoked by the request cycle
#[async_trait]
pub trait WorkerHooks: Send + Sync {
    /// Runs before the application is invoked
    async fn pre_request(&self, _worker: &WorkerState, _request: &Request) -> Result<(), AppError> {
        Ok(())
    }

    /// Runs after every parsed request; failures are ignored
    async fn post_request(
        &self,
        _worker: &WorkerState,
        _request: &Request,
        _environ: &Environ,
    ) -> Result<(), AppError> {
        Ok(())
    }
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl WorkerHooks for NoopHooks {}

/// Hooks that log each request at debug level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHooks;

#[async_trait]
impl WorkerHooks for TracingHooks {
    async fn pre_request(&self, worker: &WorkerState, request: &Request) -> Result<(), AppError> {
        tracing::debug!(
            worker_id = %worker.worker_id(),
            nr = worker.nr(),
            "{} {}",
            request.method,
            request.uri
        );
        Ok(())
    }
}
