//! Outbound notifications for job completion and failure.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::models::Job;

#[derive(Debug, Serialize)]
struct JobNotification<'a> {
    job_id: &'a str,
    repo: &'a str,
    issue_number: i64,
    command: &'a str,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// Completion notifications are best effort. Implementations log and
/// swallow delivery failures; a dead webhook must never fail a job.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn job_finished(&self, job: &Job);
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn job_finished(&self, job: &Job) {
        let payload = JobNotification {
            job_id: &job.id,
            repo: &job.repo,
            issue_number: job.issue_number,
            command: job.command.as_str(),
            status: job.status.as_str(),
            error: job.error.as_deref(),
        };
        let result = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match result {
            Ok(_) => debug!("Delivered notification for {}", job.id),
            Err(e) => warn!("Notification for {} failed: {}", job.id, e),
        }
    }
}

pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn job_finished(&self, _job: &Job) {}
}
