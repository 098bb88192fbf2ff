//! Job execution engine.
//!
//! Spawns the agent CLI for a job, streams its stdout line by line into
//! the job log and out to subscribers, watches for cancellation, and
//! drives the job to its terminal status. One engine serves all jobs; a
//! running map keyed by job id tracks live processes for input injection
//! and termination.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command as ProcessCommand};
use tokio::sync::{oneshot, Mutex};
use tracing::{error, info, warn};

use crate::broadcast::{Broadcaster, JobEvent, LifecycleEvent, GLOBAL_CHANNEL};
use crate::cancel::CancelRegistry;
use crate::config::Config;
use crate::errors::EngineError;
use crate::github::IssueClient;
use crate::logfile::JobLog;
use crate::models::{Job, JobStatus, UsageCost};
use crate::notify::Notifier;
use crate::pricing::PricingProvider;
use crate::store::JobStore;
use crate::stream::{
    decode_line, describe_tool_use, ContentBlock, LineBuffer, StreamEvent,
};
use crate::worktree::WorktreeService;

const CANCEL_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);
const CANCEL_LOG_MARKER: &str = "[overseer] cancelled by user";

struct JobHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    /// Process group id; the child is its own group leader.
    pgid: i32,
}

pub struct Engine {
    config: Arc<Config>,
    store: Arc<dyn JobStore>,
    broadcaster: Arc<Broadcaster>,
    cancels: Arc<CancelRegistry>,
    issues: Arc<dyn IssueClient>,
    worktrees: Arc<dyn WorktreeService>,
    pricing: Arc<dyn PricingProvider>,
    notifier: Arc<dyn Notifier>,
    running: Arc<Mutex<HashMap<String, JobHandle>>>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn JobStore>,
        broadcaster: Arc<Broadcaster>,
        cancels: Arc<CancelRegistry>,
        issues: Arc<dyn IssueClient>,
        worktrees: Arc<dyn WorktreeService>,
        pricing: Arc<dyn PricingProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            store,
            broadcaster,
            cancels,
            issues,
            worktrees,
            pricing,
            notifier,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run a job to completion. Every failure path lands in a persisted
    /// terminal status; this never returns an error to the spawner.
    pub async fn run_job(&self, job: Job) {
        let id = job.id.clone();
        info!("Starting job {}", id);
        if let Err(e) = self.execute(job.clone()).await {
            error!("Job {} failed to launch: {:#?}", id, e);
            let message = e.to_string();
            self.finish_job(job, JobStatus::Failed, Some(message), None)
                .await;
        }
    }

    async fn execute(&self, mut job: Job) -> Result<(), EngineError> {
        let repo_cfg = self
            .config
            .repo(&job.repo)
            .ok_or_else(|| EngineError::WorktreeFailed {
                repo: job.repo.clone(),
                issue_number: job.issue_number,
                message: "repository not configured".to_string(),
            })?
            .clone();

        let worktree = self
            .worktrees
            .acquire(&repo_cfg.path, job.issue_number, &job.issue_title)
            .await
            .map_err(|e| EngineError::WorktreeFailed {
                repo: job.repo.clone(),
                issue_number: job.issue_number,
                message: format!("{:#}", e),
            })?;

        let mut log = JobLog::create(&self.config.log_dir(), &job.id).await?;
        job.log_path = Some(log.path().display().to_string());

        let prompt = format!("/{} {}", job.command.as_str(), job.issue_number);
        let mut cmd = ProcessCommand::new(&self.config.agent.cmd);
        cmd.args(self.config.agent_flags())
            .args(["-p", &prompt])
            .current_dir(&worktree)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(session) = &job.session_id {
            cmd.args(["--resume", session]);
        }

        let mut child = cmd.spawn().map_err(EngineError::SpawnFailed)?;
        let pgid = child.id().map(|pid| pid as i32).unwrap_or(0);
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Drain stderr concurrently with the stdout loop. An agent that
        // fills the stderr pipe buffer with no reader would block and
        // never close stdout.
        let stderr_task = tokio::spawn(drain_stderr(stderr));

        {
            let mut running = self.running.lock().await;
            running.insert(job.id.clone(), JobHandle { child, stdin, pgid });
        }

        job.status = JobStatus::Running;
        job.updated_at = Utc::now();
        self.store.save_job(&job).await?;
        self.broadcaster.broadcast(&job.id, &JobEvent::StatusChanged {
            job_id: job.id.clone(),
            status: JobStatus::Running,
        });
        self.broadcaster.broadcast(GLOBAL_CHANNEL, &LifecycleEvent::JobStatusChanged {
            job: job.summary(),
        });

        // Cancellation poll, concurrent with the stream loop. Resolves true
        // when it killed the process, false when the stream finished first.
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let poll = {
            let cancels = self.cancels.clone();
            let running = self.running.clone();
            let id = job.id.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(CANCEL_POLL_INTERVAL);
                tokio::pin!(done_rx);
                loop {
                    tokio::select! {
                        _ = &mut done_rx => return false,
                        _ = ticker.tick() => {
                            if cancels.is_cancelled(&id) {
                                let mut running = running.lock().await;
                                if let Some(handle) = running.get_mut(&id) {
                                    drop(handle.stdin.take());
                                    signal_group(handle.pgid);
                                }
                                return true;
                            }
                        }
                    }
                }
            })
        };

        let outcome = self.stream_output(&mut job, stdout, &mut log).await;

        let _ = done_tx.send(());
        let was_cancelled = poll.await.unwrap_or(false);

        // Reap the process; collect stderr first, any useful error
        // message lives there.
        let handle = {
            let mut running = self.running.lock().await;
            running.remove(&job.id)
        };
        let Some(mut handle) = handle else {
            return Err(EngineError::Other(anyhow::anyhow!(
                "Process handle for {} lost from running map",
                job.id
            )));
        };
        let stderr_text = stderr_task.await.unwrap_or_default();
        let status = handle
            .child
            .wait()
            .await
            .map_err(|e| EngineError::Other(anyhow::anyhow!("Wait failed: {}", e)))?;

        if was_cancelled {
            if let Err(e) = log.append_line(CANCEL_LOG_MARKER).await {
                warn!("Failed to write cancel marker for {}: {}", job.id, e);
            }
            self.cancels.clear(&job.id);
            info!("Job {} cancelled", job.id);
            self.finish_job(job, JobStatus::Rejected, None, outcome.usage)
                .await;
            return Ok(());
        }

        match status.code() {
            Some(0) => {
                let final_status = if self.issue_is_blocked(&job).await {
                    JobStatus::Blocked
                } else {
                    JobStatus::Completed
                };
                self.finish_job(job, final_status, None, outcome.usage).await;
            }
            Some(code) => {
                if !stderr_text.is_empty() {
                    let _ = log.append_line(stderr_text.trim()).await;
                }
                self.finish_job(
                    job,
                    JobStatus::Failed,
                    Some(format!("agent exited with code {}", code)),
                    outcome.usage,
                )
                .await;
            }
            None => {
                self.finish_job(
                    job,
                    JobStatus::Failed,
                    Some("agent terminated by signal".to_string()),
                    outcome.usage,
                )
                .await;
            }
        }
        Ok(())
    }

    /// Read stdout to EOF, appending raw lines to the log and fanning
    /// decoded events out to subscribers.
    async fn stream_output(
        &self,
        job: &mut Job,
        stdout: Option<tokio::process::ChildStdout>,
        log: &mut JobLog,
    ) -> StreamOutcome {
        let mut outcome = StreamOutcome::default();
        let Some(mut stdout) = stdout else {
            return outcome;
        };

        let mut buffer = LineBuffer::new();
        let mut chunk = [0u8; 8192];
        loop {
            let read = match stdout.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("Stdout read error for {}: {}", job.id, e);
                    break;
                }
            };
            for line in buffer.push(&chunk[..read]) {
                self.handle_line(job, &line, log, &mut outcome).await;
            }
        }
        if let Some(rest) = buffer.finish() {
            self.handle_line(job, &rest, log, &mut outcome).await;
        }
        outcome
    }

    async fn handle_line(
        &self,
        job: &mut Job,
        line: &str,
        log: &mut JobLog,
        outcome: &mut StreamOutcome,
    ) {
        if let Err(e) = log.append_line(line).await {
            warn!("Failed to append log for {}: {}", job.id, e);
        }
        let Some(event) = decode_line(line) else {
            return;
        };
        match event {
            StreamEvent::Assistant { message, session_id } => {
                if !session_id.is_empty() {
                    job.session_id = Some(session_id);
                }
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            self.broadcaster.broadcast(&job.id, &JobEvent::AssistantText {
                                job_id: job.id.clone(),
                                text,
                            });
                        }
                        ContentBlock::ToolUse { name, input, .. } => {
                            let summary = describe_tool_use(&name, &input);
                            self.broadcaster.broadcast(&job.id, &JobEvent::ToolUse {
                                job_id: job.id.clone(),
                                tool: name,
                                summary,
                            });
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            StreamEvent::ContentBlockDelta { delta } => {
                if let Some(text) = delta.and_then(|d| d.text) {
                    self.broadcaster.broadcast(&job.id, &JobEvent::AssistantText {
                        job_id: job.id.clone(),
                        text,
                    });
                }
            }
            StreamEvent::User { tool_use_result } => {
                if let Some(result) = tool_use_result {
                    let summary = result
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| "tool result".to_string());
                    self.broadcaster.broadcast(&job.id, &JobEvent::ToolResult {
                        job_id: job.id.clone(),
                        summary,
                    });
                }
            }
            StreamEvent::Result {
                session_id,
                usage,
                model,
                is_error,
                ..
            } => {
                if let Some(session) = session_id {
                    job.session_id = Some(session);
                }
                if let Some(usage) = usage {
                    let model = model.unwrap_or_else(|| "unknown".to_string());
                    let cost_usd = self.pricing.pricing_for(&model).cost_usd(&usage);
                    outcome.usage = Some(UsageCost {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        cache_read_tokens: usage.cache_read_input_tokens,
                        cache_write_tokens: usage.cache_creation_input_tokens,
                        cost_usd,
                        model,
                    });
                }
                if is_error {
                    self.broadcaster.broadcast(&job.id, &JobEvent::Error {
                        job_id: job.id.clone(),
                        message: "agent reported an error result".to_string(),
                    });
                }
            }
            StreamEvent::System { .. } => {}
        }
    }

    /// Persist the terminal status, broadcast it, then fire the
    /// best-effort side effects. Side effects log and never block the
    /// transition.
    async fn finish_job(
        &self,
        mut job: Job,
        status: JobStatus,
        error: Option<String>,
        usage: Option<UsageCost>,
    ) {
        job.status = status;
        job.updated_at = Utc::now();
        if status.is_terminal() {
            job.completed_at = Some(job.updated_at);
        }
        if error.is_some() {
            job.error = error;
        }
        if usage.is_some() {
            job.usage = usage;
        }
        if let Err(e) = self.store.save_job(&job).await {
            error!("Failed to persist terminal status for {}: {}", job.id, e);
        }

        self.broadcaster.broadcast(&job.id, &JobEvent::Result {
            job_id: job.id.clone(),
            status,
            usage: job.usage.clone(),
        });
        let lifecycle = match status {
            JobStatus::Completed => LifecycleEvent::JobCompleted { job: job.summary() },
            JobStatus::Failed => LifecycleEvent::JobFailed { job: job.summary() },
            _ => LifecycleEvent::JobStatusChanged { job: job.summary() },
        };
        self.broadcaster.broadcast(GLOBAL_CHANNEL, &lifecycle);
        self.broadcaster.broadcast(GLOBAL_CHANNEL, &LifecycleEvent::WorkflowUpdated {
            repo: job.repo.clone(),
            issue_number: job.issue_number,
        });

        info!("Job {} finished: {}", job.id, status);
        self.sync_issue(&job).await;
        self.notifier.job_finished(&job).await;
    }

    /// Post a completion comment back on the issue.
    async fn sync_issue(&self, job: &Job) {
        let body = match job.status {
            JobStatus::Completed => {
                format!("`{}` finished for this issue (job `{}`).", job.command, job.id)
            }
            JobStatus::Failed => format!(
                "`{}` failed for this issue (job `{}`): {}",
                job.command,
                job.id,
                job.error.as_deref().unwrap_or("unknown error")
            ),
            _ => return,
        };
        if let Err(e) = self
            .issues
            .post_comment(&job.repo, job.issue_number, &body)
            .await
        {
            warn!("Failed to comment on {}#{}: {:#}", job.repo, job.issue_number, e);
        }
    }

    /// Exit 0 does not mean done: the agent flags work it could not finish
    /// by labeling the issue, so re-check before declaring victory.
    async fn issue_is_blocked(&self, job: &Job) -> bool {
        match self.issues.get_issue(&job.repo, job.issue_number).await {
            Ok(issue) => issue.has_label(&self.config.agent.blocked_label),
            Err(e) => {
                warn!(
                    "Blocked-label check for {}#{} failed, assuming unblocked: {:#}",
                    job.repo, job.issue_number, e
                );
                false
            }
        }
    }

    /// Stop a tracked job's process. Idempotent; unknown ids are a no-op.
    /// The stream loop reaps the child and records the terminal status.
    pub async fn terminate(&self, job_id: &str) {
        let mut running = self.running.lock().await;
        if let Some(handle) = running.get_mut(job_id) {
            drop(handle.stdin.take());
            signal_group(handle.pgid);
            info!("Terminated job {}", job_id);
        }
    }

    /// Write a line of user input to a tracked job's stdin. Returns false
    /// when the job is not tracked or its stdin is gone.
    pub async fn send_input(&self, job_id: &str, content: &str) -> bool {
        let mut running = self.running.lock().await;
        let Some(handle) = running.get_mut(job_id) else {
            return false;
        };
        let Some(stdin) = handle.stdin.as_mut() else {
            return false;
        };
        let envelope = json!({ "type": "user_input", "content": content });
        let mut line = envelope.to_string();
        line.push('\n');
        match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await.is_ok(),
            Err(e) => {
                warn!("Input write to {} failed: {}", job_id, e);
                false
            }
        }
    }

    pub async fn running_job_ids(&self) -> Vec<String> {
        let running = self.running.lock().await;
        let mut ids: Vec<String> = running.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Terminate every tracked job. Used on shutdown; the stream loops
    /// observe the exits and persist terminal statuses as usual.
    pub async fn shutdown(&self) {
        let ids = self.running_job_ids().await;
        for id in ids {
            self.terminate(&id).await;
        }
    }
}

#[derive(Default)]
struct StreamOutcome {
    usage: Option<UsageCost>,
}

fn signal_group(pgid: i32) {
    if pgid <= 0 {
        return;
    }
    // SAFETY: plain syscall on a pgid we created via process_group(0).
    unsafe {
        libc::killpg(pgid, libc::SIGTERM);
    }
}

async fn drain_stderr(stderr: Option<tokio::process::ChildStderr>) -> String {
    let Some(stderr) = stderr else {
        return String::new();
    };
    let mut text = String::new();
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        text.push_str(&line);
        text.push('\n');
    }
    text
}
