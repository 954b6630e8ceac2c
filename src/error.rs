//! Error taxonomy for the engine.
//!
//! Each component owns a `thiserror`-derived enum scoped to its own failure
//! modes; [`EngineError`] composes them via `#[from]` so callers that only
//! care about "did the request succeed" can use `anyhow::Result`, while
//! callers that need to branch (e.g. retry on [`EngineError::ResourceExhausted`])
//! can match on the concrete variant.

use crate::{isolation::IsolationError, job::JobError, registry::RegistryError};

/// Top-level error returned by request-facing operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed request, unknown runtime, path escape, unknown signal.
    #[error("validation error: {0}")]
    Validation(String),

    /// No free sandbox slot, or a per-client/global concurrency cap was hit.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Isolation(#[from] IsolationError),

    #[error(transparent)]
    Job(#[from] JobError),

    /// Unexpected OS error during cleanup, pipe I/O, or reaping.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// `true` for errors that are safe to retry (the caller did nothing wrong).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ResourceExhausted(_)
                | EngineError::Isolation(IsolationError::Exhausted)
                | EngineError::Job(JobError::Isolation(IsolationError::Exhausted))
        )
    }
}
