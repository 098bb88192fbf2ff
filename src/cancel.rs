use std::collections::HashSet;
use std::sync::Mutex;

/// Process-wide set of cancelled job ids, checked by the engine's poll loop
/// without any I/O. Intentionally volatile: loss on crash is acceptable
/// because startup recovery reclassifies all running jobs as interrupted.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    cancelled: Mutex<HashSet<String>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self, job_id: &str) {
        self.lock().insert(job_id.to_string());
    }

    pub fn is_cancelled(&self, job_id: &str) -> bool {
        self.lock().contains(job_id)
    }

    /// Remove a flag once the engine has acted on it. Idempotent.
    pub fn clear(&self, job_id: &str) {
        self.lock().remove(job_id);
    }

    /// Diagnostic snapshot of currently flagged ids.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // A panic while holding this lock is a bug; recover the data rather
        // than poisoning every future cancellation check.
        self.cancelled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
