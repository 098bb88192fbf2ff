//! Typed error hierarchy for the Overseer orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError` — persistence failures, both backends
//! - `EngineError` — subprocess execution failures
//! - `TriggerError` — client-visible trigger-boundary conditions

use thiserror::Error;

/// Errors from the persistence layer. Every backend I/O failure collapses
/// into `Backend` — the caller decides retry/skip/log.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(#[source] anyhow::Error),

    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Corrupt record for job {id}: {message}")]
    Corrupt { id: String, message: String },
}

impl StoreError {
    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        Self::Backend(err.into())
    }
}

/// Errors from a single job execution.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Failed to open job log at {}: {source}", path.display())]
    LogOpenFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Worktree setup failed for {repo}#{issue_number}: {message}")]
    WorktreeFailed {
        repo: String,
        issue_number: i64,
        message: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced at the trigger boundary. Conditions a client can act
/// on (unknown repo, already-active id) are reported through the trigger
/// outcome, not as errors; only persistence failures escape.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}
