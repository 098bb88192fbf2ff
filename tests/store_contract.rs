//! Both persistence backends answer the same contract. The suite runs
//! once against SQLite and once against a remote store backed by an
//! in-process HTTP fixture.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use overseer::models::{Command, Job, JobStatus, UsageCost};
use overseer::store::remote::RemoteStore;
use overseer::store::sqlite::SqliteStore;
use overseer::store::JobStore;

async fn contract_suite(store: &dyn JobStore) {
    store.initialize().await.unwrap();

    // Round trip with usage attached.
    let mut job = Job::new("acme/widget", 7, "Fix the widget", Command::Plan);
    job.session_id = Some("sess-1".to_string());
    job.usage = Some(UsageCost {
        input_tokens: 1200,
        output_tokens: 400,
        cache_read_tokens: 9000,
        cache_write_tokens: 100,
        cost_usd: 0.0123,
        model: "claude-sonnet-4-5".to_string(),
    });
    store.save_job(&job).await.unwrap();

    let loaded = store.get_job("widget-7-plan").await.unwrap().unwrap();
    assert_eq!(loaded.issue_title, "Fix the widget");
    assert_eq!(loaded.session_id.as_deref(), Some("sess-1"));
    let usage = loaded.usage.as_ref().unwrap();
    assert_eq!(usage.cache_read_tokens, 9000);
    assert_eq!(usage.model, "claude-sonnet-4-5");

    // Missing id.
    assert!(store.get_job("ghost-1-plan").await.unwrap().is_none());

    // Save is an upsert on the deterministic id.
    let mut retrigger = Job::new("acme/widget", 7, "Fix the widget, again", Command::Plan);
    retrigger.status = JobStatus::Running;
    store.save_job(&retrigger).await.unwrap();
    let loaded = store.get_job("widget-7-plan").await.unwrap().unwrap();
    assert_eq!(loaded.issue_title, "Fix the widget, again");
    assert_eq!(loaded.status, JobStatus::Running);

    // Terminal transition stamps completed_at and keeps the error.
    store
        .update_job_status("widget-7-plan", JobStatus::Failed, Some("exit code 2"))
        .await
        .unwrap();
    let failed = store.get_job("widget-7-plan").await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.completed_at.is_some());
    assert_eq!(failed.error.as_deref(), Some("exit code 2"));

    // A later terminal transition keeps the first completed_at stamp.
    let first_completed = failed.completed_at;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    store
        .update_job_status("widget-7-plan", JobStatus::Rejected, None)
        .await
        .unwrap();
    let rejected = store.get_job("widget-7-plan").await.unwrap().unwrap();
    assert_eq!(rejected.status, JobStatus::Rejected);
    assert_eq!(rejected.completed_at, first_completed);

    // Unknown id on update is NotFound, not silence.
    let err = store
        .update_job_status("ghost-1-plan", JobStatus::Running, None)
        .await
        .unwrap_err();
    assert!(matches!(err, overseer::errors::StoreError::NotFound { .. }));

    // Fuzzy: unique suffix resolves, ambiguous does not.
    store
        .save_job(&Job::new("acme/widget", 8, "t", Command::Plan))
        .await
        .unwrap();
    let fuzzy = store.get_job_fuzzy("8-plan").await.unwrap().unwrap();
    assert_eq!(fuzzy.id, "widget-8-plan");
    store
        .save_job(&Job::new("acme/gadget", 8, "t", Command::Plan))
        .await
        .unwrap();
    assert!(store.get_job_fuzzy("8-plan").await.unwrap().is_none());

    // Listing is newest first.
    let jobs = store.get_all_jobs().await.unwrap();
    assert!(jobs.len() >= 3);
    for pair in jobs.windows(2) {
        assert!(pair[0].started_at >= pair[1].started_at);
    }

    // Startup recovery flips running jobs exactly once. Jobs that are
    // merely queued or parked at an approval gate survive a restart.
    let mut running = Job::new("acme/widget", 9, "t", Command::Implement);
    running.status = JobStatus::Running;
    store.save_job(&running).await.unwrap();
    let mut waiting = Job::new("acme/widget", 10, "t", Command::Plan);
    waiting.status = JobStatus::WaitingApproval;
    store.save_job(&waiting).await.unwrap();
    let ids = store.mark_interrupted_jobs().await.unwrap();
    assert_eq!(ids, vec!["widget-9-implement".to_string()]);
    let recovered = store.get_job("widget-9-implement").await.unwrap().unwrap();
    assert_eq!(recovered.status, JobStatus::Interrupted);
    assert!(recovered.completed_at.is_some());
    let parked = store.get_job("widget-10-plan").await.unwrap().unwrap();
    assert_eq!(parked.status, JobStatus::WaitingApproval);
    let queued = store.get_job("widget-8-plan").await.unwrap().unwrap();
    assert_eq!(queued.status, JobStatus::Pending);
    assert!(store.mark_interrupted_jobs().await.unwrap().is_empty());

    // Fuzzy lookup reaches jobs the retention window no longer lists.
    let mut relic = Job::new("acme/relic", 42, "t", Command::Plan);
    relic.started_at = chrono::Utc::now() - chrono::Duration::days(40);
    relic.status = JobStatus::Completed;
    relic.completed_at = Some(relic.started_at);
    store.save_job(&relic).await.unwrap();
    let listed = store.get_all_jobs().await.unwrap();
    assert!(listed.iter().all(|j| j.id != "relic-42-plan"));
    let found = store.get_job_fuzzy("42-plan").await.unwrap().unwrap();
    assert_eq!(found.id, "relic-42-plan");
}

#[tokio::test]
async fn sqlite_store_honors_the_contract() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = SqliteStore::open(&dir.path().join("jobs.db")).await.unwrap();
    contract_suite(&store).await;
}

#[tokio::test]
async fn remote_store_honors_the_contract() {
    let base_url = spawn_fixture().await;
    let store = RemoteStore::new(base_url, Some("test-token".to_string()));
    contract_suite(&store).await;
}

type Docs = Arc<Mutex<HashMap<String, Value>>>;

/// Minimal document server speaking the remote-store wire protocol.
async fn spawn_fixture() -> String {
    let docs: Docs = Arc::new(Mutex::new(HashMap::new()));
    let app = Router::new()
        .route("/v1/jobs", get(list_docs))
        .route("/v1/jobs/{id}", get(get_doc).put(put_doc))
        .with_state(docs);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn list_docs(State(docs): State<Docs>) -> Json<Value> {
    let docs = docs.lock().await;
    let jobs: Vec<&Value> = docs.values().collect();
    Json(json!({ "jobs": jobs }))
}

async fn get_doc(State(docs): State<Docs>, Path(id): Path<String>) -> Result<Json<Value>, StatusCode> {
    let docs = docs.lock().await;
    docs.get(&id).cloned().map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn put_doc(State(docs): State<Docs>, Path(id): Path<String>, Json(body): Json<Value>) -> StatusCode {
    docs.lock().await.insert(id, body);
    StatusCode::OK
}
