//! Job persistence.
//!
//! Two backends implement the same [`JobStore`] contract: an embedded
//! SQLite database ([`sqlite`]) and a remote document store ([`remote`]).
//! [`cache`] wraps either with a short read-through TTL so hot job-status
//! polls do not hammer the backend.

pub mod cache;
pub mod remote;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Config, StorageBackend};
use crate::errors::StoreError;
use crate::models::{Job, JobStatus};

/// Jobs older than this are dropped from listings.
pub const RETENTION_DAYS: i64 = 30;

/// Listings never return more rows than this, newest first.
pub const LIST_CAP: usize = 100;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create schema or verify connectivity. Called once at startup before
    /// anything else touches the store.
    async fn initialize(&self) -> Result<(), StoreError>;

    /// Jobs within the retention window, ordered by `started_at`
    /// descending with id ascending as the tiebreak, capped at
    /// [`LIST_CAP`] rows.
    async fn get_all_jobs(&self) -> Result<Vec<Job>, StoreError>;

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// Look up a job by id suffix, for CLI convenience (`7-plan` instead
    /// of `widget-7-plan`). Exact id matches win outright; otherwise the
    /// suffix must identify exactly one job, and an ambiguous suffix
    /// returns nothing rather than guessing.
    async fn get_job_fuzzy(&self, suffix: &str) -> Result<Option<Job>, StoreError>;

    /// Insert or fully overwrite a job row.
    async fn save_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Transition a job's status, stamping `updated_at` and, for terminal
    /// statuses, `completed_at`. `error` replaces the stored error text
    /// when given.
    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Flip every `running` job to `interrupted`, returning the affected
    /// ids. Startup recovery: a job that was running when the previous
    /// process died has no process anymore. No other status changes.
    async fn mark_interrupted_jobs(&self) -> Result<Vec<String>, StoreError>;
}

/// Resolve the suffix-match rule shared by both backends: exact id first,
/// then a unique `-`-boundary suffix.
pub(crate) fn fuzzy_pick(jobs: Vec<Job>, suffix: &str) -> Option<Job> {
    if let Some(exact) = jobs.iter().find(|j| j.id == suffix) {
        return Some(exact.clone());
    }
    let needle = format!("-{}", suffix);
    let mut matches = jobs.into_iter().filter(|j| j.id.ends_with(&needle));
    let first = matches.next()?;
    if matches.next().is_some() {
        return None;
    }
    Some(first)
}

/// Build the configured backend, wrapped in the TTL cache.
pub async fn open(config: &Config) -> Result<Arc<dyn JobStore>, StoreError> {
    let inner: Arc<dyn JobStore> = match config.storage.backend {
        StorageBackend::Sqlite => {
            Arc::new(sqlite::SqliteStore::open(&config.sqlite_path()).await?)
        }
        StorageBackend::Remote => {
            let url = config.storage.remote_url.clone().ok_or_else(|| {
                StoreError::backend(anyhow::anyhow!("Remote backend selected but no URL set"))
            })?;
            Arc::new(remote::RemoteStore::new(
                url,
                config.storage.remote_token.clone(),
            ))
        }
    };
    inner.initialize().await?;
    Ok(Arc::new(cache::CachedStore::new(inner)))
}
