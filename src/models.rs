use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The named operation a job executes against an issue.
/// Each command maps to a trigger label and an agent CLI prompt template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Plan,
    Implement,
    Revise,
    Retrospective,
}

impl Command {
    pub const ALL: [Command; 4] = [
        Self::Plan,
        Self::Implement,
        Self::Revise,
        Self::Retrospective,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Implement => "implement",
            Self::Revise => "revise",
            Self::Retrospective => "retrospective",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "implement" => Ok(Self::Implement),
            "revise" => Ok(Self::Revise),
            "retrospective" => Ok(Self::Retrospective),
            _ => Err(format!("Invalid command: {}", s)),
        }
    }
}

/// Lifecycle status of a job.
///
/// Active statuses block a re-trigger of the same id; terminal statuses
/// stamp `completed_at`. `Interrupted` is assigned only at process startup
/// to jobs left `running` by a prior process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    WaitingApproval,
    ApprovedResume,
    Completed,
    Failed,
    Blocked,
    Rejected,
    Interrupted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::ApprovedResume => "approved_resume",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Rejected => "rejected",
            Self::Interrupted => "interrupted",
        }
    }

    /// Whether a job in this status blocks a re-trigger of the same id.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::WaitingApproval)
    }

    /// Whether the engine drives no further transition from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Blocked | Self::Rejected | Self::Interrupted
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "waiting_approval" => Ok(Self::WaitingApproval),
            "approved_resume" => Ok(Self::ApprovedResume),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            "rejected" => Ok(Self::Rejected),
            "interrupted" => Ok(Self::Interrupted),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Token counts and the cost computed from them at stream end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageCost {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    pub cost_usd: f64,
    pub model: String,
}

/// Durable record of one command execution against one issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub repo: String,
    pub issue_number: i64,
    pub issue_title: String,
    pub command: Command,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub log_path: Option<String>,
    pub session_id: Option<String>,
    pub error: Option<String>,
    pub usage: Option<UsageCost>,
}

impl Job {
    pub fn new(repo: &str, issue_number: i64, issue_title: &str, command: Command) -> Self {
        let now = Utc::now();
        Self {
            id: job_id(repo, issue_number, command),
            repo: repo.to_string(),
            issue_number,
            issue_title: issue_title.to_string(),
            command,
            status: JobStatus::Pending,
            started_at: now,
            created_at: now,
            updated_at: now,
            completed_at: None,
            log_path: None,
            session_id: None,
            error: None,
            usage: None,
        }
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            repo: self.repo.clone(),
            issue_number: self.issue_number,
            command: self.command,
            status: self.status,
        }
    }
}

/// Compute the deterministic job id for (repo slug, issue, command).
/// Re-triggering the same command on the same issue always addresses the
/// same record: `acme/widget` #7 `plan` → `widget-7-plan`.
pub fn job_id(repo: &str, issue_number: i64, command: Command) -> String {
    let name = repo.rsplit('/').next().unwrap_or(repo);
    format!("{}-{}-{}", name, issue_number, command.as_str())
}

/// Minimal projection carried by global lifecycle events and list views.
/// Never the full record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    pub repo: String,
    pub issue_number: i64,
    pub command: Command,
    pub status: JobStatus,
}
