//! Embedded SQLite backend.
//!
//! Usage figures are flattened into nullable columns on the jobs row;
//! `input_tokens` is the presence marker when rebuilding [`UsageCost`].
//! All access runs on tokio's blocking pool via `spawn_blocking` so
//! synchronous SQLite I/O never ties up async workers. The write
//! connection and the read connection sit behind separate locks: with WAL
//! enabled, reads proceed while a write holds its own lock.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{fuzzy_pick, JobStore, LIST_CAP, RETENTION_DAYS};
use crate::errors::StoreError;
use crate::models::{Command, Job, JobStatus, UsageCost};

#[derive(Clone)]
pub struct SqliteStore {
    write: Arc<Mutex<Connection>>,
    /// Own lock, so listings never queue behind a long write. In-memory
    /// databases share the write connection to stay on the same data.
    read: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::open_blocking(&path))
            .await
            .map_err(|e| StoreError::backend(anyhow::anyhow!("DB open task panicked: {}", e)))?
            .map_err(StoreError::backend)
    }

    fn open_blocking(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let write = Connection::open(path).context("Failed to open SQLite database")?;
        write
            .pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;
        write
            .pragma_update(None, "busy_timeout", 5000)
            .context("Failed to set busy timeout")?;
        run_migrations(&write).context("Failed to run migrations")?;

        let read = Connection::open(path).context("Failed to open read connection")?;
        read.pragma_update(None, "busy_timeout", 5000)
            .context("Failed to set read busy timeout")?;
        Ok(Self {
            write: Arc::new(Mutex::new(write)),
            read: Arc::new(Mutex::new(read)),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let write = Connection::open_in_memory()
            .context("Failed to open in-memory SQLite database")
            .map_err(StoreError::backend)?;
        run_migrations(&write)
            .context("Failed to run migrations")
            .map_err(StoreError::backend)?;
        let write = Arc::new(Mutex::new(write));
        Ok(Self {
            read: Arc::clone(&write),
            write,
        })
    }

    /// Run a read-only closure on the blocking pool against the read
    /// connection. Data passed into `f` must be owned.
    async fn call_read<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        run_on(Arc::clone(&self.read), f).await
    }

    /// Like [`call_read`], on the write connection.
    async fn call_write<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        run_on(Arc::clone(&self.write), f).await
    }
}

async fn run_on<F, R>(conn: Arc<Mutex<Connection>>, f: F) -> Result<R, StoreError>
where
    F: FnOnce(&Connection) -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let guard = lock(&conn)?;
        f(&guard)
    })
    .await
    .map_err(|e| StoreError::backend(anyhow::anyhow!("DB task panicked: {}", e)))?
    .map_err(|e| match e.downcast::<StoreError>() {
        Ok(store_err) => store_err,
        Err(other) => StoreError::backend(other),
    })
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        // Schema was created on open; verify the connection answers.
        self.call_read(|conn| {
            conn.query_row("SELECT count(*) FROM jobs", [], |row| row.get::<_, i64>(0))
                .context("Job table missing after migration")?;
            Ok(())
        })
        .await
    }

    async fn get_all_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.call_read(list_jobs).await
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let id = id.to_string();
        self.call_read(move |conn| get_job(conn, &id)).await
    }

    async fn get_job_fuzzy(&self, suffix: &str) -> Result<Option<Job>, StoreError> {
        let suffix = suffix.to_string();
        self.call_read(move |conn| {
            if let Some(exact) = get_job(conn, &suffix)? {
                return Ok(Some(exact));
            }
            // Suffix resolution runs over every job, not the capped
            // retention-windowed listing, so both backends resolve the
            // same ids.
            Ok(fuzzy_pick(list_every_job(conn)?, &suffix))
        })
        .await
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        let job = job.clone();
        self.call_write(move |conn| upsert_job(conn, &job)).await
    }

    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let id_owned = id.to_string();
        let error = error.map(str::to_string);
        let found = self
            .call_write(move |conn| update_status(conn, &id_owned, status, error.as_deref()))
            .await?;
        if !found {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn mark_interrupted_jobs(&self) -> Result<Vec<String>, StoreError> {
        self.call_write(mark_interrupted).await
    }
}

const JOB_COLUMNS: &str = "id, repo, issue_number, issue_title, command, status, \
     started_at, created_at, updated_at, completed_at, log_path, session_id, error, \
     input_tokens, output_tokens, cache_read_tokens, cache_write_tokens, cost_usd, model";

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            repo TEXT NOT NULL,
            issue_number INTEGER NOT NULL,
            issue_title TEXT NOT NULL,
            command TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT,
            log_path TEXT,
            session_id TEXT,
            error TEXT,
            input_tokens INTEGER,
            output_tokens INTEGER,
            cache_read_tokens INTEGER,
            cache_write_tokens INTEGER,
            cost_usd REAL,
            model TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_started ON jobs(started_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
        ",
    )
    .context("Failed to create jobs table")?;
    Ok(())
}

fn list_jobs(conn: &Connection) -> Result<Vec<Job>> {
    let cutoff = (Utc::now() - Duration::days(RETENTION_DAYS)).to_rfc3339();
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM jobs WHERE started_at >= ?1 \
             ORDER BY started_at DESC, id ASC LIMIT {}",
            JOB_COLUMNS, LIST_CAP
        ))
        .context("Failed to prepare list_jobs")?;
    let rows = stmt
        .query_map(params![cutoff], JobRow::from_row)
        .context("Failed to query jobs")?;
    collect_jobs(rows)
}

/// Every row, no retention window, no cap. Feeds fuzzy lookup only.
fn list_every_job(conn: &Connection) -> Result<Vec<Job>> {
    let mut stmt = conn
        .prepare(&format!("SELECT {} FROM jobs ORDER BY id", JOB_COLUMNS))
        .context("Failed to prepare full job scan")?;
    let rows = stmt
        .query_map([], JobRow::from_row)
        .context("Failed to query jobs")?;
    collect_jobs(rows)
}

fn collect_jobs(rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<JobRow>>) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    for row in rows {
        jobs.push(row.context("Failed to read job row")?.into_job()?);
    }
    Ok(jobs)
}

fn get_job(conn: &Connection, id: &str) -> Result<Option<Job>> {
    let mut stmt = conn
        .prepare(&format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS))
        .context("Failed to prepare get_job")?;
    let row = stmt
        .query_row(params![id], JobRow::from_row)
        .optional()
        .context("Failed to query job")?;
    row.map(JobRow::into_job).transpose()
}

fn upsert_job(conn: &Connection, job: &Job) -> Result<()> {
    let usage = job.usage.as_ref();
    conn.execute(
        "INSERT INTO jobs (id, repo, issue_number, issue_title, command, status, \
         started_at, created_at, updated_at, completed_at, log_path, session_id, error, \
         input_tokens, output_tokens, cache_read_tokens, cache_write_tokens, cost_usd, model) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19) \
         ON CONFLICT(id) DO UPDATE SET \
         repo = excluded.repo, issue_number = excluded.issue_number, \
         issue_title = excluded.issue_title, command = excluded.command, \
         status = excluded.status, started_at = excluded.started_at, \
         created_at = excluded.created_at, updated_at = excluded.updated_at, \
         completed_at = excluded.completed_at, log_path = excluded.log_path, \
         session_id = excluded.session_id, error = excluded.error, \
         input_tokens = excluded.input_tokens, output_tokens = excluded.output_tokens, \
         cache_read_tokens = excluded.cache_read_tokens, \
         cache_write_tokens = excluded.cache_write_tokens, \
         cost_usd = excluded.cost_usd, model = excluded.model",
        params![
            job.id,
            job.repo,
            job.issue_number,
            job.issue_title,
            job.command.as_str(),
            job.status.as_str(),
            job.started_at.to_rfc3339(),
            job.created_at.to_rfc3339(),
            job.updated_at.to_rfc3339(),
            job.completed_at.map(|t| t.to_rfc3339()),
            job.log_path,
            job.session_id,
            job.error,
            usage.map(|u| u.input_tokens),
            usage.map(|u| u.output_tokens),
            usage.map(|u| u.cache_read_tokens),
            usage.map(|u| u.cache_write_tokens),
            usage.map(|u| u.cost_usd),
            usage.map(|u| u.model.as_str()),
        ],
    )
    .context("Failed to upsert job")?;
    Ok(())
}

/// Returns false when no row has the given id. An already-stamped
/// `completed_at` is preserved on repeated terminal updates.
fn update_status(conn: &Connection, id: &str, status: JobStatus, error: Option<&str>) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let completed_at = status.is_terminal().then(|| now.clone());
    let changed = conn
        .execute(
            "UPDATE jobs SET status = ?1, updated_at = ?2, \
             completed_at = COALESCE(completed_at, ?3), \
             error = COALESCE(?4, error) \
             WHERE id = ?5",
            params![status.as_str(), now, completed_at, error, id],
        )
        .context("Failed to update job status")?;
    Ok(changed > 0)
}

/// Startup recovery. Only `running` rows flip: a pending job was never
/// started and a waiting-approval job is parked on an external decision,
/// so neither loses state on restart.
fn mark_interrupted(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT id FROM jobs WHERE status = 'running' ORDER BY id")
        .context("Failed to prepare interrupted scan")?;
    let ids: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .context("Failed to scan running jobs")?
        .collect::<rusqlite::Result<_>>()
        .context("Failed to read running job ids")?;
    drop(stmt);

    let now = Utc::now().to_rfc3339();
    for id in &ids {
        conn.execute(
            "UPDATE jobs SET status = 'interrupted', updated_at = ?1, \
             completed_at = COALESCE(completed_at, ?1), \
             error = COALESCE(error, 'Interrupted by restart') \
             WHERE id = ?2",
            params![now, id],
        )
        .with_context(|| format!("Failed to mark {} interrupted", id))?;
    }
    Ok(ids)
}

struct JobRow {
    id: String,
    repo: String,
    issue_number: i64,
    issue_title: String,
    command: String,
    status: String,
    started_at: String,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
    log_path: Option<String>,
    session_id: Option<String>,
    error: Option<String>,
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    cache_read_tokens: Option<i64>,
    cache_write_tokens: Option<i64>,
    cost_usd: Option<f64>,
    model: Option<String>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repo: row.get(1)?,
            issue_number: row.get(2)?,
            issue_title: row.get(3)?,
            command: row.get(4)?,
            status: row.get(5)?,
            started_at: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            completed_at: row.get(9)?,
            log_path: row.get(10)?,
            session_id: row.get(11)?,
            error: row.get(12)?,
            input_tokens: row.get(13)?,
            output_tokens: row.get(14)?,
            cache_read_tokens: row.get(15)?,
            cache_write_tokens: row.get(16)?,
            cost_usd: row.get(17)?,
            model: row.get(18)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let corrupt = |message: String| StoreError::Corrupt {
            id: self.id.clone(),
            message,
        };
        let parse_time = |value: &str| -> Result<DateTime<Utc>, StoreError> {
            DateTime::parse_from_rfc3339(value)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("Bad timestamp {:?}: {}", value, e)))
        };

        let command = Command::from_str(&self.command)
            .map_err(|e| corrupt(format!("Bad command: {}", e)))?;
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| corrupt(format!("Bad status: {}", e)))?;
        // Usage presence is keyed on the primary numeric column, not on
        // the model text.
        let usage = match self.input_tokens {
            Some(input_tokens) => Some(UsageCost {
                input_tokens,
                output_tokens: self.output_tokens.unwrap_or(0),
                cache_read_tokens: self.cache_read_tokens.unwrap_or(0),
                cache_write_tokens: self.cache_write_tokens.unwrap_or(0),
                cost_usd: self.cost_usd.unwrap_or(0.0),
                model: self.model.clone().unwrap_or_else(|| "unknown".to_string()),
            }),
            None => None,
        };

        Ok(Job {
            started_at: parse_time(&self.started_at)?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_time).transpose()?,
            id: self.id,
            repo: self.repo,
            issue_number: self.issue_number,
            issue_title: self.issue_title,
            command,
            status,
            log_path: self.log_path,
            session_id: self.session_id,
            error: self.error,
            usage,
        })
    }
}
