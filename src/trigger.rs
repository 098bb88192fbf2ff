//! Label-driven job creation.
//!
//! Everything that starts a job funnels through [`TriggerService::trigger`]:
//! webhook deliveries, reconciler polls, and the CLI all hit the same
//! dedup check, so a command never runs twice concurrently for the same
//! issue no matter how many sources report the label.

use std::sync::Arc;

use tracing::{info, warn};

use crate::broadcast::{Broadcaster, JobEvent, LifecycleEvent, GLOBAL_CHANNEL};
use crate::cancel::CancelRegistry;
use crate::config::Config;
use crate::engine::Engine;
use crate::errors::TriggerError;
use crate::github::IssueClient;
use crate::models::{job_id, Command, Job, JobStatus};
use crate::store::JobStore;

#[derive(Debug)]
pub enum TriggerOutcome {
    /// A new pending job was created and handed to the engine.
    Started(Job),
    /// The job id already has an active run; nothing was created.
    Skipped(String),
    /// The request was understood but cannot run. Client-visible, not a
    /// crash.
    Failed(String),
}

pub struct TriggerService {
    config: Arc<Config>,
    store: Arc<dyn JobStore>,
    broadcaster: Arc<Broadcaster>,
    cancels: Arc<CancelRegistry>,
    issues: Arc<dyn IssueClient>,
    engine: Arc<Engine>,
}

impl TriggerService {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn JobStore>,
        broadcaster: Arc<Broadcaster>,
        cancels: Arc<CancelRegistry>,
        issues: Arc<dyn IssueClient>,
        engine: Arc<Engine>,
    ) -> Self {
        Self {
            config,
            store,
            broadcaster,
            cancels,
            issues,
            engine,
        }
    }

    /// Create and launch a job for (repo, issue, command). `label` is the
    /// triggering label to remove from the issue, when one exists.
    ///
    /// The dedup check and the pending insert are not atomic; two
    /// concurrent triggers for the same id can both pass the check. The
    /// second save then overwrites the first's row and both runs proceed.
    pub async fn trigger(
        &self,
        repo: &str,
        issue_number: i64,
        issue_title: &str,
        command: Command,
        label: Option<&str>,
    ) -> Result<TriggerOutcome, TriggerError> {
        let id = job_id(repo, issue_number, command);

        if let Some(existing) = self.store.get_job(&id).await? {
            if existing.status.is_active() {
                return Ok(TriggerOutcome::Skipped(id));
            }
        }

        if self.config.repo(repo).is_none() {
            return Ok(TriggerOutcome::Failed(format!(
                "unknown repository {}",
                repo
            )));
        }

        // A flag left over from a cancellation that landed after the
        // previous run of this id exited would kill the new run on its
        // first poll tick.
        self.cancels.clear(&id);

        let mut job = Job::new(repo, issue_number, issue_title, command);
        if let Some(session) = self.resumable_session(&id).await {
            job.session_id = Some(session);
        }
        self.store.save_job(&job).await?;
        self.broadcaster.broadcast(GLOBAL_CHANNEL, &LifecycleEvent::JobCreated {
            job: job.summary(),
        });
        info!("Triggered {} ({} #{} {})", job.id, repo, issue_number, command);

        if let Some(label) = label {
            if let Err(e) = self.issues.remove_label(repo, issue_number, label).await {
                warn!("Failed to remove trigger label {} from {}#{}: {:#}", label, repo, issue_number, e);
            }
        }

        let engine = self.engine.clone();
        let spawned = job.clone();
        tokio::spawn(async move {
            engine.run_job(spawned).await;
        });

        Ok(TriggerOutcome::Started(job))
    }

    /// Session token from the prior run of this id, when that run was
    /// approved to resume. A waiting-approval prior is still active and
    /// never reaches this point — the dedup check skipped it already.
    async fn resumable_session(&self, id: &str) -> Option<String> {
        let prior = self.store.get_job(id).await.ok().flatten()?;
        match prior.status {
            JobStatus::ApprovedResume => prior.session_id,
            _ => None,
        }
    }

    /// Externally driven approval transition. Only valid from
    /// `waiting_approval`.
    pub async fn approve(&self, id: &str) -> Result<bool, TriggerError> {
        let Some(job) = self.store.get_job(id).await? else {
            return Ok(false);
        };
        if job.status != JobStatus::WaitingApproval {
            return Ok(false);
        }
        self.store
            .update_job_status(id, JobStatus::ApprovedResume, None)
            .await?;
        self.broadcaster.broadcast(id, &JobEvent::StatusChanged {
            job_id: id.to_string(),
            status: JobStatus::ApprovedResume,
        });
        if let Some(updated) = self.store.get_job(id).await? {
            self.broadcaster.broadcast(GLOBAL_CHANNEL, &LifecycleEvent::JobStatusChanged {
                job: updated.summary(),
            });
        }
        info!("Approved {}", id);
        Ok(true)
    }
}
