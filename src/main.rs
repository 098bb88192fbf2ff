use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use overseer::broadcast::{Broadcaster, JobEvent};
use overseer::cancel::CancelRegistry;
use overseer::config::Config;
use overseer::engine::Engine;
use overseer::errors::StoreError;
use overseer::github::{GitHubClient, IssueClient};
use overseer::logfile;
use overseer::models::{Command as JobCommand, Job};
use overseer::notify::{NoopNotifier, Notifier, WebhookNotifier};
use overseer::pricing::{PricingProvider, RefreshingPricing, StaticPricing};
use overseer::reconcile::Reconciler;
use overseer::store::{self, JobStore};
use overseer::trigger::{TriggerOutcome, TriggerService};
use overseer::workflow::derive_workflow;
use overseer::worktree::GitWorktreeService;

#[derive(Parser)]
#[command(name = "overseer")]
#[command(version, about = "Label-driven orchestration of an AI coding agent")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to overseer.toml. Defaults to ./overseer.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator: startup recovery, label polling, job execution
    Serve,
    /// Trigger a command for an issue and wait for the job to finish
    Trigger {
        /// Repository slug, e.g. acme/widget
        repo: String,
        issue_number: i64,
        /// plan | implement | revise | retrospective
        command: JobCommand,
    },
    /// List recent jobs
    Jobs,
    /// Show one job (id or unique id suffix)
    Show { id: String },
    /// Mark a job rejected (id or unique id suffix)
    Cancel { id: String },
    /// Print a job's log (id or unique id suffix)
    Logs {
        id: String,
        /// Keep polling for new output
        #[arg(short, long)]
        follow: bool,
    },
    /// Approve a job waiting for plan approval
    Approve { id: String },
    /// Show the derived workflow state for an issue
    Workflow { repo: String, issue_number: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "overseer=debug" } else { "overseer=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    let config = Arc::new(Config::load(cli.config.as_deref())?);
    config.ensure_directories()?;
    let store = store::open(&config).await?;

    match cli.command {
        Commands::Serve => serve(config, store).await,
        Commands::Trigger {
            repo,
            issue_number,
            command,
        } => trigger_and_wait(config, store, &repo, issue_number, command).await,
        Commands::Jobs => list_jobs(store).await,
        Commands::Show { id } => show_job(store, &id).await,
        Commands::Cancel { id } => cancel_job(store, &id).await,
        Commands::Logs { id, follow } => show_logs(store, &id, follow).await,
        Commands::Approve { id } => approve_job(config, store, &id).await,
        Commands::Workflow { repo, issue_number } => {
            show_workflow(config, store, &repo, issue_number).await
        }
    }
}

struct Services {
    engine: Arc<Engine>,
    trigger: Arc<TriggerService>,
    reconciler: Arc<Reconciler>,
    broadcaster: Arc<Broadcaster>,
}

fn build_services(config: Arc<Config>, store: Arc<dyn JobStore>) -> Services {
    let broadcaster = Arc::new(Broadcaster::new());
    let cancels = Arc::new(CancelRegistry::new());
    let issues: Arc<dyn IssueClient> = Arc::new(GitHubClient::new(
        config.github.api_url.clone(),
        config.github.token.clone().unwrap_or_default(),
    ));
    let worktrees = Arc::new(GitWorktreeService::new(
        config
            .repos
            .first()
            .map(|r| r.default_branch.clone())
            .unwrap_or_else(|| "main".to_string()),
    ));
    let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(NoopNotifier),
    };
    let pricing: Arc<dyn PricingProvider> = match &config.pricing.url {
        Some(url) => {
            let refreshing = Arc::new(RefreshingPricing::new(url.clone()));
            let period = Duration::from_secs(config.pricing.refresh_secs.max(60));
            let task = refreshing.clone();
            // First tick fires immediately, so rates are fresh before the
            // first job finishes.
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    task.refresh().await;
                }
            });
            refreshing
        }
        None => Arc::new(StaticPricing::new()),
    };

    let engine = Arc::new(Engine::new(
        config.clone(),
        store.clone(),
        broadcaster.clone(),
        cancels.clone(),
        issues.clone(),
        worktrees.clone(),
        pricing,
        notifier,
    ));
    let trigger = Arc::new(TriggerService::new(
        config.clone(),
        store.clone(),
        broadcaster.clone(),
        cancels,
        issues.clone(),
        engine.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        config,
        store,
        issues,
        worktrees,
        trigger.clone(),
    ));
    Services {
        engine,
        trigger,
        reconciler,
        broadcaster,
    }
}

async fn serve(config: Arc<Config>, store: Arc<dyn JobStore>) -> Result<()> {
    let services = build_services(config, store);
    info!("Overseer starting");

    let reconciler = services.reconciler.clone();
    let loop_task = tokio::spawn(async move { reconciler.run().await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down, terminating running jobs");
    loop_task.abort();
    services.engine.shutdown().await;
    Ok(())
}

async fn trigger_and_wait(
    config: Arc<Config>,
    store: Arc<dyn JobStore>,
    repo: &str,
    issue_number: i64,
    command: JobCommand,
) -> Result<()> {
    let services = build_services(config, store.clone());
    let outcome = services
        .trigger
        .trigger(repo, issue_number, &format!("issue #{}", issue_number), command, None)
        .await?;
    let job = match outcome {
        TriggerOutcome::Started(job) => job,
        TriggerOutcome::Skipped(id) => {
            println!("{} is already running", id);
            return Ok(());
        }
        TriggerOutcome::Failed(reason) => bail!(reason),
    };

    println!("Started {}", job.id);
    // Job-channel subscription; the first message is the connect ack.
    let (_sub, mut events) = services.broadcaster.subscribe_job(&job.id);
    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        while let Ok(line) = events.try_recv() {
            if let Ok(JobEvent::AssistantText { text, .. }) = serde_json::from_str(&line) {
                println!("{}", text.trim_end());
            }
        }
        let Some(current) = store.get_job(&job.id).await? else {
            bail!("Job {} disappeared from the store", job.id);
        };
        if !current.status.is_active() {
            print_job(&current);
            break;
        }
    }
    Ok(())
}

async fn list_jobs(store: Arc<dyn JobStore>) -> Result<()> {
    let jobs = store.get_all_jobs().await?;
    if jobs.is_empty() {
        println!("No jobs in the last 30 days.");
        return Ok(());
    }
    println!("{:<40} {:<17} {:<25} {}", "ID", "STATUS", "STARTED", "COST");
    for job in jobs {
        let cost = job
            .usage
            .as_ref()
            .map(|u| format!("${:.4}", u.cost_usd))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<40} {:<17} {:<25} {}",
            job.id,
            job.status.as_str(),
            job.started_at.format("%Y-%m-%d %H:%M:%S"),
            cost
        );
    }
    Ok(())
}

async fn resolve(store: &Arc<dyn JobStore>, id: &str) -> Result<Job> {
    match store.get_job_fuzzy(id).await {
        Ok(Some(job)) => Ok(job),
        Ok(None) => bail!("No unique job matches {:?}", id),
        Err(StoreError::NotFound { id }) => bail!("No job {}", id),
        Err(e) => Err(e.into()),
    }
}

async fn show_job(store: Arc<dyn JobStore>, id: &str) -> Result<()> {
    let job = resolve(&store, id).await?;
    print_job(&job);
    Ok(())
}

fn print_job(job: &Job) {
    println!("{}", job.id);
    println!("  repo:       {}", job.repo);
    println!("  issue:      #{} {}", job.issue_number, job.issue_title);
    println!("  command:    {}", job.command);
    println!("  status:     {}", job.status);
    println!("  started:    {}", job.started_at.to_rfc3339());
    if let Some(completed) = job.completed_at {
        println!("  completed:  {}", completed.to_rfc3339());
    }
    if let Some(log) = &job.log_path {
        println!("  log:        {}", log);
    }
    if let Some(session) = &job.session_id {
        println!("  session:    {}", session);
    }
    if let Some(error) = &job.error {
        println!("  error:      {}", error);
    }
    if let Some(usage) = &job.usage {
        println!(
            "  usage:      {} in / {} out / {} cache read ({}) = ${:.4}",
            usage.input_tokens, usage.output_tokens, usage.cache_read_tokens, usage.model, usage.cost_usd
        );
    }
}

/// Out-of-process cancel: marks the record rejected. A serve process that
/// still owns the child reaps it on its next startup recovery; in-process
/// cancellation goes through the `CancelRegistry` instead.
async fn cancel_job(store: Arc<dyn JobStore>, id: &str) -> Result<()> {
    let job = resolve(&store, id).await?;
    if !job.status.is_active() {
        println!("{} already {}", job.id, job.status);
        return Ok(());
    }
    store
        .update_job_status(&job.id, overseer::models::JobStatus::Rejected, Some("cancelled"))
        .await?;
    println!("Cancelled {}", job.id);
    Ok(())
}

async fn show_logs(store: Arc<dyn JobStore>, id: &str, follow: bool) -> Result<()> {
    let job = resolve(&store, id).await?;
    let Some(path) = job.log_path.as_deref() else {
        bail!("Job {} has no log yet", job.id);
    };
    let path = PathBuf::from(path);

    // Large logs open at the tail; the follow loop then reads
    // incrementally from where that left off.
    const LOG_TAIL_BYTES: u64 = 64 * 1024;
    let first = logfile::tail_last(&path, LOG_TAIL_BYTES)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    for line in &first.lines {
        println!("{}", line);
    }
    let mut offset = first.next_offset;

    while follow {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let chunk = logfile::tail(&path, offset)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if chunk.truncated {
            println!("[log truncated, restarting from the top]");
        }
        for line in &chunk.lines {
            println!("{}", line);
        }
        offset = chunk.next_offset;
    }
    Ok(())
}

async fn approve_job(config: Arc<Config>, store: Arc<dyn JobStore>, id: &str) -> Result<()> {
    let job = resolve(&store, id).await?;
    let services = build_services(config, store);
    if services.trigger.approve(&job.id).await? {
        println!("Approved {}", job.id);
    } else {
        println!("{} is not waiting for approval", job.id);
    }
    Ok(())
}

async fn show_workflow(
    config: Arc<Config>,
    store: Arc<dyn JobStore>,
    repo: &str,
    issue_number: i64,
) -> Result<()> {
    let jobs: Vec<Job> = store
        .get_all_jobs()
        .await?
        .into_iter()
        .filter(|j| j.repo == repo && j.issue_number == issue_number)
        .collect();
    let issues = GitHubClient::new(
        config.github.api_url.clone(),
        config.github.token.clone().unwrap_or_default(),
    );
    let closed = match issues.get_issue(repo, issue_number).await {
        Ok(issue) => issue.state != "open",
        Err(_) => false,
    };
    let state = derive_workflow(&jobs, closed);
    println!("phase:       {}", state.phase.as_str());
    println!("next action: {}", state.next_action);
    println!("can revise:  {}", state.can_revise);
    println!("can merge:   {}", state.can_merge);
    Ok(())
}
