//! Derived workflow state for an issue.
//!
//! A pure projection of one issue's job set into the phase a user sees on
//! the board. Never persisted; recomputing on every read keeps it
//! consistent with the jobs by construction.

use serde::Serialize;

use crate::models::{Command, Job, JobStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    New,
    Planning,
    PlanComplete,
    Implementing,
    Review,
    Complete,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Planning => "planning",
            Self::PlanComplete => "plan_complete",
            Self::Implementing => "implementing",
            Self::Review => "review",
            Self::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowState {
    pub phase: Phase,
    /// What the user should trigger next: a command name, or "done".
    pub next_action: &'static str,
    pub can_revise: bool,
    pub can_merge: bool,
}

impl WorkflowState {
    fn new(phase: Phase, next_action: &'static str) -> Self {
        Self {
            phase,
            next_action,
            can_revise: false,
            can_merge: false,
        }
    }
}

/// Latest job for a command, by `started_at` with id as tiebreak so equal
/// timestamps still pick deterministically.
fn latest<'a>(jobs: &'a [Job], command: Command) -> Option<&'a Job> {
    jobs.iter()
        .filter(|j| j.command == command)
        .max_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)))
}

fn succeeded(job: Option<&Job>) -> bool {
    matches!(job, Some(j) if j.status == JobStatus::Completed)
}

fn active(job: Option<&Job>) -> bool {
    matches!(job, Some(j) if j.status.is_active())
}

/// Project an issue's jobs plus its open/closed state into a phase.
///
/// Identical inputs always produce identical output; callers may compare
/// serialized states byte for byte.
pub fn derive_workflow(jobs: &[Job], issue_closed: bool) -> WorkflowState {
    if issue_closed {
        return WorkflowState::new(Phase::Complete, "done");
    }

    let plan = latest(jobs, Command::Plan);
    let implement = latest(jobs, Command::Implement);
    let revise = latest(jobs, Command::Revise);

    if active(implement) || active(revise) {
        return WorkflowState::new(Phase::Implementing, "wait");
    }

    if succeeded(implement) {
        // A failed revise keeps the issue in review; the fix is another
        // revise pass, not a re-implement.
        let mut state = WorkflowState::new(Phase::Review, "merge");
        state.can_revise = true;
        state.can_merge = true;
        return state;
    }

    if matches!(implement, Some(j) if j.status.is_terminal()) {
        // Implement ran and did not succeed; offer the retry.
        return WorkflowState::new(Phase::Implementing, "implement");
    }

    if active(plan) {
        return WorkflowState::new(Phase::Planning, "wait");
    }

    if succeeded(plan) {
        return WorkflowState::new(Phase::PlanComplete, "implement");
    }

    if matches!(plan, Some(j) if j.status.is_terminal()) {
        return WorkflowState::new(Phase::Planning, "plan");
    }

    WorkflowState::new(Phase::New, "plan")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn job(command: Command, status: JobStatus) -> Job {
        let mut j = Job::new("acme/widget", 7, "t", command);
        j.status = status;
        j
    }

    #[test]
    fn test_no_jobs_is_new() {
        let state = derive_workflow(&[], false);
        assert_eq!(state.phase, Phase::New);
        assert_eq!(state.next_action, "plan");
        assert!(!state.can_revise && !state.can_merge);
    }

    #[test]
    fn test_closed_issue_wins_over_everything() {
        let jobs = vec![job(Command::Implement, JobStatus::Running)];
        let state = derive_workflow(&jobs, true);
        assert_eq!(state.phase, Phase::Complete);
        assert_eq!(state.next_action, "done");
        assert!(!state.can_merge);
    }

    #[test]
    fn test_active_plan_is_planning() {
        let jobs = vec![job(Command::Plan, JobStatus::Running)];
        assert_eq!(derive_workflow(&jobs, false).phase, Phase::Planning);
    }

    #[test]
    fn test_completed_plan_awaits_implement() {
        let jobs = vec![job(Command::Plan, JobStatus::Completed)];
        let state = derive_workflow(&jobs, false);
        assert_eq!(state.phase, Phase::PlanComplete);
        assert_eq!(state.next_action, "implement");
    }

    #[test]
    fn test_failed_plan_offers_retry() {
        let jobs = vec![job(Command::Plan, JobStatus::Failed)];
        let state = derive_workflow(&jobs, false);
        assert_eq!(state.phase, Phase::Planning);
        assert_eq!(state.next_action, "plan");
    }

    #[test]
    fn test_completed_implement_is_review_with_gates_open() {
        let jobs = vec![
            job(Command::Plan, JobStatus::Completed),
            job(Command::Implement, JobStatus::Completed),
        ];
        let state = derive_workflow(&jobs, false);
        assert_eq!(state.phase, Phase::Review);
        assert!(state.can_revise);
        assert!(state.can_merge);
    }

    #[test]
    fn test_active_revise_gates_merge_off() {
        let jobs = vec![
            job(Command::Implement, JobStatus::Completed),
            job(Command::Revise, JobStatus::Running),
        ];
        let state = derive_workflow(&jobs, false);
        assert_eq!(state.phase, Phase::Implementing);
        assert!(!state.can_merge);
    }

    #[test]
    fn test_failed_revise_stays_in_review() {
        let jobs = vec![
            job(Command::Implement, JobStatus::Completed),
            job(Command::Revise, JobStatus::Failed),
        ];
        let state = derive_workflow(&jobs, false);
        assert_eq!(state.phase, Phase::Review);
        assert!(state.can_revise);
    }

    #[test]
    fn test_latest_job_per_command_decides() {
        let mut failed = job(Command::Implement, JobStatus::Failed);
        failed.started_at = Utc::now() - Duration::hours(1);
        let retried = job(Command::Implement, JobStatus::Completed);
        let state = derive_workflow(&[failed, retried], false);
        assert_eq!(state.phase, Phase::Review);
    }

    #[test]
    fn test_determinism_byte_for_byte() {
        let jobs = vec![
            job(Command::Plan, JobStatus::Completed),
            job(Command::Implement, JobStatus::Running),
        ];
        let a = serde_json::to_string(&derive_workflow(&jobs, false)).unwrap();
        let b = serde_json::to_string(&derive_workflow(&jobs, false)).unwrap();
        assert_eq!(a, b);
    }
}
