//! Remote document-store backend.
//!
//! Jobs live as JSON documents at `PUT/GET {base}/v1/jobs/{id}` with a
//! listing at `GET {base}/v1/jobs`. Documents use camelCase keys and keep
//! usage as a nested object, unlike the flattened SQLite row. Retention,
//! ordering, and the listing cap are applied on this side so both backends
//! answer identically.

use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{fuzzy_pick, JobStore, LIST_CAP, RETENTION_DAYS};
use crate::errors::StoreError;
use crate::models::{Command, Job, JobStatus, UsageCost};

pub struct RemoteStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobDoc {
    id: String,
    repo: String,
    issue_number: i64,
    issue_title: String,
    command: String,
    status: String,
    started_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    log_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    usage: Option<UsageDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageDoc {
    input_tokens: i64,
    output_tokens: i64,
    cache_read_tokens: i64,
    cache_write_tokens: i64,
    cost_usd: f64,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    jobs: Vec<JobDoc>,
}

impl JobDoc {
    fn from_job(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            repo: job.repo.clone(),
            issue_number: job.issue_number,
            issue_title: job.issue_title.clone(),
            command: job.command.as_str().to_string(),
            status: job.status.as_str().to_string(),
            started_at: job.started_at,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
            log_path: job.log_path.clone(),
            session_id: job.session_id.clone(),
            error: job.error.clone(),
            usage: job.usage.as_ref().map(|u| UsageDoc {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
                cache_read_tokens: u.cache_read_tokens,
                cache_write_tokens: u.cache_write_tokens,
                cost_usd: u.cost_usd,
                model: u.model.clone(),
            }),
        }
    }

    fn into_job(self) -> Result<Job, StoreError> {
        let corrupt = |message: String| StoreError::Corrupt {
            id: self.id.clone(),
            message,
        };
        let command = Command::from_str(&self.command)
            .map_err(|e| corrupt(format!("Bad command: {}", e)))?;
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| corrupt(format!("Bad status: {}", e)))?;
        Ok(Job {
            id: self.id,
            repo: self.repo,
            issue_number: self.issue_number,
            issue_title: self.issue_title,
            command,
            status,
            started_at: self.started_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            log_path: self.log_path,
            session_id: self.session_id,
            error: self.error,
            usage: self.usage.map(|u| UsageCost {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
                cache_read_tokens: u.cache_read_tokens,
                cache_write_tokens: u.cache_write_tokens,
                cost_usd: u.cost_usd,
                model: u.model,
            }),
        })
    }
}

impl RemoteStore {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn fetch_all(&self) -> Result<Vec<Job>, StoreError> {
        let resp = self
            .request(reqwest::Method::GET, "/v1/jobs")
            .send()
            .await
            .context("Failed to list jobs from remote store")
            .map_err(StoreError::backend)?
            .error_for_status()
            .context("Remote store rejected job listing")
            .map_err(StoreError::backend)?;
        let body: ListResponse = resp
            .json()
            .await
            .context("Failed to parse job listing")
            .map_err(StoreError::backend)?;
        body.jobs.into_iter().map(JobDoc::into_job).collect()
    }

    async fn fetch_one(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/v1/jobs/{}", id))
            .send()
            .await
            .with_context(|| format!("Failed to fetch job {}", id))
            .map_err(StoreError::backend)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let doc: JobDoc = resp
            .error_for_status()
            .with_context(|| format!("Remote store rejected fetch of {}", id))
            .map_err(StoreError::backend)?
            .json()
            .await
            .with_context(|| format!("Failed to parse job {}", id))
            .map_err(StoreError::backend)?;
        Ok(Some(doc.into_job()?))
    }

    async fn put(&self, job: &Job) -> Result<(), StoreError> {
        self.request(reqwest::Method::PUT, &format!("/v1/jobs/{}", job.id))
            .json(&JobDoc::from_job(job))
            .send()
            .await
            .with_context(|| format!("Failed to store job {}", job.id))
            .map_err(StoreError::backend)?
            .error_for_status()
            .with_context(|| format!("Remote store rejected job {}", job.id))
            .map_err(StoreError::backend)?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for RemoteStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        // Connectivity check; the remote side owns its schema.
        self.fetch_all().await.map(|_| ())
    }

    async fn get_all_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let cutoff = Utc::now() - Duration::days(RETENTION_DAYS);
        let mut jobs: Vec<Job> = self
            .fetch_all()
            .await?
            .into_iter()
            .filter(|j| j.started_at >= cutoff)
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(a.id.cmp(&b.id)));
        jobs.truncate(LIST_CAP);
        Ok(jobs)
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        self.fetch_one(id).await
    }

    async fn get_job_fuzzy(&self, suffix: &str) -> Result<Option<Job>, StoreError> {
        if let Some(job) = self.fetch_one(suffix).await? {
            return Ok(Some(job));
        }
        Ok(fuzzy_pick(self.fetch_all().await?, suffix))
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.put(job).await
    }

    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut job = self
            .fetch_one(id)
            .await?
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        job.status = status;
        job.updated_at = Utc::now();
        if status.is_terminal() && job.completed_at.is_none() {
            job.completed_at = Some(job.updated_at);
        }
        if let Some(error) = error {
            job.error = Some(error.to_string());
        }
        self.put(&job).await
    }

    async fn mark_interrupted_jobs(&self) -> Result<Vec<String>, StoreError> {
        let mut interrupted = Vec::new();
        for job in self.fetch_all().await? {
            // Only running jobs lost their process; pending and
            // waiting-approval jobs keep their state across a restart.
            if job.status != JobStatus::Running {
                continue;
            }
            self.update_job_status(
                &job.id,
                JobStatus::Interrupted,
                Some("Interrupted by restart"),
            )
            .await?;
            interrupted.push(job.id);
        }
        interrupted.sort();
        Ok(interrupted)
    }
}
