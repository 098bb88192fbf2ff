//! Periodic reconciliation.
//!
//! Webhook deliveries get lost; the poll loop is the backstop. Every tick
//! it walks each configured repository and command label and pushes any
//! labeled issue through the trigger chokepoint, where active jobs are
//! skipped as usual. Maintenance sweeps piggyback on the same loop at
//! longer multiples of the tick.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::github::IssueClient;
use crate::models::Command;
use crate::store::JobStore;

/// Resume tokens go stale on the agent side well before job retention
/// expires them from listings.
const SESSION_TTL_DAYS: i64 = 7;
use crate::trigger::{TriggerOutcome, TriggerService};
use crate::worktree::WorktreeService;

pub struct Reconciler {
    config: Arc<Config>,
    store: Arc<dyn JobStore>,
    issues: Arc<dyn IssueClient>,
    worktrees: Arc<dyn WorktreeService>,
    trigger: Arc<TriggerService>,
}

impl Reconciler {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn JobStore>,
        issues: Arc<dyn IssueClient>,
        worktrees: Arc<dyn WorktreeService>,
        trigger: Arc<TriggerService>,
    ) -> Self {
        Self {
            config,
            store,
            issues,
            worktrees,
            trigger,
        }
    }

    /// Run forever. Call once at startup, after the store is open.
    pub async fn run(&self) {
        self.recover_interrupted().await;

        let period = std::time::Duration::from_secs(self.config.reconcile.interval_secs.max(1));
        let worktree_ticks = self.config.reconcile.worktree_cleanup_ticks.max(1);
        let session_ticks = self.config.reconcile.session_cleanup_ticks.max(1);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tick: u64 = 0;

        loop {
            interval.tick().await;
            tick += 1;
            self.scan_labels().await;

            if tick % worktree_ticks == 0 {
                if let Err(e) = self.cleanup_worktrees().await {
                    warn!("Worktree cleanup failed: {:#}", e);
                }
            }
            if tick % session_ticks == 0 {
                if let Err(e) = self.expire_sessions().await {
                    warn!("Session cleanup failed: {:#}", e);
                }
            }
        }
    }

    /// Jobs still marked active from a previous process have no process
    /// behind them anymore; flip them to interrupted before anything else
    /// reads the store.
    async fn recover_interrupted(&self) {
        match self.store.mark_interrupted_jobs().await {
            Ok(ids) if ids.is_empty() => {}
            Ok(ids) => info!("Marked {} jobs interrupted from previous run: {:?}", ids.len(), ids),
            Err(e) => warn!("Startup interruption sweep failed: {}", e),
        }
    }

    /// One pass over every repo × command label. A listing failure skips
    /// that pair for this tick only.
    async fn scan_labels(&self) {
        for repo in &self.config.repos {
            for command in Command::ALL {
                let label = self.config.trigger_label(command);
                let issues = match self
                    .issues
                    .list_open_issues_with_label(&repo.slug, &label)
                    .await
                {
                    Ok(issues) => issues,
                    Err(e) => {
                        warn!("Listing {} issues labeled {} failed: {:#}", repo.slug, label, e);
                        continue;
                    }
                };
                for issue in issues {
                    match self
                        .trigger
                        .trigger(&repo.slug, issue.number, &issue.title, command, Some(&label))
                        .await
                    {
                        Ok(TriggerOutcome::Started(job)) => {
                            info!("Reconciler started {}", job.id);
                        }
                        Ok(TriggerOutcome::Skipped(id)) => {
                            debug!("Reconciler skipped active {}", id);
                        }
                        Ok(TriggerOutcome::Failed(reason)) => {
                            warn!("Reconciler could not start {}#{}: {}", repo.slug, issue.number, reason);
                        }
                        Err(e) => {
                            warn!("Trigger for {}#{} errored: {}", repo.slug, issue.number, e);
                        }
                    }
                }
            }
        }
    }

    /// Remove worktrees whose issue has no active job.
    async fn cleanup_worktrees(&self) -> anyhow::Result<()> {
        let jobs = self.store.get_all_jobs().await?;
        for repo in &self.config.repos {
            let checked_out = self.worktrees.list(&repo.path).await?;
            for issue_number in checked_out {
                let in_use = jobs.iter().any(|j| {
                    j.repo == repo.slug && j.issue_number == issue_number && j.status.is_active()
                });
                if in_use {
                    continue;
                }
                let open = match self.issues.get_issue(&repo.slug, issue_number).await {
                    Ok(issue) => issue.state == "open",
                    Err(e) => {
                        warn!("Skipping worktree check for {}#{}: {:#}", repo.slug, issue_number, e);
                        continue;
                    }
                };
                if open {
                    continue;
                }
                if let Err(e) = self.worktrees.release(&repo.path, issue_number).await {
                    warn!("Failed to remove worktree for {}#{}: {:#}", repo.slug, issue_number, e);
                } else {
                    info!("Pruned worktree for closed issue {}#{}", repo.slug, issue_number);
                }
            }
        }
        Ok(())
    }

    /// Drop resume tokens from terminal jobs past the session TTL; the
    /// agent will not accept them anymore.
    async fn expire_sessions(&self) -> anyhow::Result<()> {
        let cutoff = Utc::now() - Duration::days(SESSION_TTL_DAYS);
        for job in self.store.get_all_jobs().await? {
            if job.session_id.is_none() || !job.status.is_terminal() {
                continue;
            }
            let ended = job.completed_at.unwrap_or(job.updated_at);
            if ended >= cutoff {
                continue;
            }
            let mut expired = job.clone();
            expired.session_id = None;
            expired.updated_at = Utc::now();
            if let Err(e) = self.store.save_job(&expired).await {
                warn!("Failed to expire session for {}: {}", job.id, e);
            } else {
                debug!("Expired session token for {}", job.id);
            }
        }
        Ok(())
    }
}
