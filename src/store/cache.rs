//! Read-through cache over a [`JobStore`] backend.
//!
//! Live log viewers poll job status every second or faster; a short TTL on
//! single-job reads keeps that traffic off the backend without letting a
//! status change go stale for more than a few seconds. Writes refresh the
//! cached entry immediately, so the common poll-after-write sees the new
//! status at once. Listings always hit the backend: there is one listing
//! per dashboard load, not one per poll.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::JobStore;
use crate::errors::StoreError;
use crate::models::{Job, JobStatus};

pub const CACHE_TTL: Duration = Duration::from_secs(5);

struct Entry {
    job: Option<Job>,
    fetched_at: Instant,
}

pub struct CachedStore {
    inner: std::sync::Arc<dyn JobStore>,
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

impl CachedStore {
    pub fn new(inner: std::sync::Arc<dyn JobStore>) -> Self {
        Self::with_ttl(inner, CACHE_TTL)
    }

    pub fn with_ttl(inner: std::sync::Arc<dyn JobStore>, ttl: Duration) -> Self {
        Self {
            inner,
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn cached(&self, id: &str) -> Option<Option<Job>> {
        let entries = self.lock();
        let entry = entries.get(id)?;
        if entry.fetched_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.job.clone())
    }

    fn store_entry(&self, id: &str, job: Option<Job>) {
        self.lock().insert(
            id.to_string(),
            Entry {
                job,
                fetched_at: Instant::now(),
            },
        );
    }

    fn invalidate_all(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl JobStore for CachedStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        self.inner.initialize().await
    }

    async fn get_all_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.inner.get_all_jobs().await
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        if let Some(hit) = self.cached(id) {
            return Ok(hit);
        }
        let job = self.inner.get_job(id).await?;
        self.store_entry(id, job.clone());
        Ok(job)
    }

    async fn get_job_fuzzy(&self, suffix: &str) -> Result<Option<Job>, StoreError> {
        // Suffix resolution depends on the whole id set; never cached.
        self.inner.get_job_fuzzy(suffix).await
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.inner.save_job(job).await?;
        self.store_entry(&job.id, Some(job.clone()));
        Ok(())
    }

    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.inner.update_job_status(id, status, error).await?;
        // The backend stamped timestamps we did not see; refetch rather
        // than patching the cached copy.
        match self.inner.get_job(id).await {
            Ok(job) => self.store_entry(id, job),
            Err(_) => {
                self.lock().remove(id);
            }
        }
        Ok(())
    }

    async fn mark_interrupted_jobs(&self) -> Result<Vec<String>, StoreError> {
        let ids = self.inner.mark_interrupted_jobs().await?;
        self.invalidate_all();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::models::Command;
    use crate::store::sqlite::SqliteStore;

    /// Counts backend reads so tests can tell hits from misses.
    struct CountingStore {
        inner: SqliteStore,
        reads: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: SqliteStore::in_memory().unwrap(),
                reads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobStore for CountingStore {
        async fn initialize(&self) -> Result<(), StoreError> {
            self.inner.initialize().await
        }
        async fn get_all_jobs(&self) -> Result<Vec<Job>, StoreError> {
            self.inner.get_all_jobs().await
        }
        async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_job(id).await
        }
        async fn get_job_fuzzy(&self, suffix: &str) -> Result<Option<Job>, StoreError> {
            self.inner.get_job_fuzzy(suffix).await
        }
        async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
            self.inner.save_job(job).await
        }
        async fn update_job_status(
            &self,
            id: &str,
            status: JobStatus,
            error: Option<&str>,
        ) -> Result<(), StoreError> {
            self.inner.update_job_status(id, status, error).await
        }
        async fn mark_interrupted_jobs(&self) -> Result<Vec<String>, StoreError> {
            self.inner.mark_interrupted_jobs().await
        }
    }

    #[tokio::test]
    async fn test_repeated_reads_hit_cache() {
        let backend = Arc::new(CountingStore::new());
        let cache = CachedStore::new(backend.clone());
        let job = Job::new("acme/widget", 7, "t", Command::Plan);
        backend.inner.save_job(&job).await.unwrap();

        for _ in 0..5 {
            assert!(cache.get_job(&job.id).await.unwrap().is_some());
        }
        assert_eq!(backend.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_negative_results_are_cached_too() {
        let backend = Arc::new(CountingStore::new());
        let cache = CachedStore::new(backend.clone());
        for _ in 0..3 {
            assert!(cache.get_job("ghost-1-plan").await.unwrap().is_none());
        }
        assert_eq!(backend.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_refetches() {
        let backend = Arc::new(CountingStore::new());
        let cache = CachedStore::with_ttl(backend.clone(), Duration::ZERO);
        let job = Job::new("acme/widget", 7, "t", Command::Plan);
        backend.inner.save_job(&job).await.unwrap();

        cache.get_job(&job.id).await.unwrap();
        cache.get_job(&job.id).await.unwrap();
        assert_eq!(backend.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_save_makes_new_state_visible_within_ttl() {
        let backend = Arc::new(CountingStore::new());
        let cache = CachedStore::new(backend.clone());
        let mut job = Job::new("acme/widget", 7, "t", Command::Plan);
        cache.save_job(&job).await.unwrap();
        assert_eq!(
            cache.get_job(&job.id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );

        job.status = JobStatus::Running;
        cache.save_job(&job).await.unwrap();
        assert_eq!(
            cache.get_job(&job.id).await.unwrap().unwrap().status,
            JobStatus::Running
        );
        // Both reads answered from cache entries refreshed by the writes.
        assert_eq!(backend.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_update_status_refreshes_entry() {
        let backend = Arc::new(CountingStore::new());
        let cache = CachedStore::new(backend.clone());
        let job = Job::new("acme/widget", 7, "t", Command::Plan);
        cache.save_job(&job).await.unwrap();

        cache
            .update_job_status(&job.id, JobStatus::Completed, None)
            .await
            .unwrap();
        let loaded = cache.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert!(loaded.completed_at.is_some());
    }
}
