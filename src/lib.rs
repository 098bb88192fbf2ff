//! Overseer — label-driven orchestration of an AI coding agent.
//!
//! ## Overview
//!
//! A label on a GitHub issue triggers a job: the agent CLI runs inside an
//! isolated git worktree, its stream-json output is persisted to a log and
//! broadcast to live observers, and its exit drives the job to a terminal
//! status. A reconciliation loop polls for labels that webhooks missed and
//! recovers jobs orphaned by a restart.
//!
//! ## Module Map
//!
//! ```text
//! label event ──> trigger.rs (dedup, pending Job) ──┐
//!                      ^                             │ tokio::spawn
//! reconcile.rs ────────┘                             v
//!   (60s poll,                              engine.rs (spawn agent,
//!    startup recovery,                        stream loop + cancel poll)
//!    maintenance)                                │
//!                                 ┌──────────────┼──────────────┐
//!                                 v              v              v
//!                           logfile.rs      broadcast.rs    store/
//!                           (job log,       (per-job +      (sqlite │ remote,
//!                            tail)           global fanout)  TTL cache)
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                         |
//! |------------|--------------------------------------------------------|
//! | `models`   | `Job`, `JobStatus`, `Command`, deterministic `job_id`  |
//! | `stream`   | stream-json protocol types + `LineBuffer`              |
//! | `cancel`   | `CancelRegistry`, the volatile cancellation flag set   |
//! | `workflow` | pure phase derivation for an issue's job set           |
//! | `github`   | `IssueClient` trait + REST implementation              |
//! | `worktree` | `WorktreeService` trait + git worktree implementation  |
//! | `pricing`  | per-model token rates, cost computation                |
//! | `notify`   | best-effort completion webhooks                        |
//! | `config`   | TOML + env configuration                               |

pub mod broadcast;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod errors;
pub mod github;
pub mod logfile;
pub mod models;
pub mod notify;
pub mod pricing;
pub mod reconcile;
pub mod store;
pub mod stream;
pub mod trigger;
pub mod workflow;
pub mod worktree;
