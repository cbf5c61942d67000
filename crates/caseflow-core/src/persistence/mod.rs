//! Persistence interfaces and backends for caseflow-core.
//!
//! All cross-invocation shared state (jobs, case stage checkpoints, rate
//! windows) lives behind this trait. Worker invocations are short-lived and
//! may run concurrently across processes, so every state-affecting operation
//! here is an atomic conditional update, never read-then-write.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;

/// Job record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    /// Unique identifier for the job.
    pub id: String,
    /// Queue this job belongs to.
    pub queue_name: String,
    /// Opaque job payload.
    pub data: serde_json::Value,
    /// Current status (pending, processing, completed, failed).
    pub status: String,
    /// Higher priority jobs are claimed first.
    pub priority: i32,
    /// Number of attempts consumed so far.
    pub attempts: i32,
    /// Maximum attempts before permanent failure.
    pub max_attempts: i32,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
    /// Earliest time the job is eligible to be claimed.
    pub scheduled_for: DateTime<Utc>,
    /// When the current (or last) lease began.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the job permanently failed.
    pub failed_at: Option<DateTime<Utc>>,
    /// Error message from the most recent failure.
    pub error: Option<String>,
    /// Result data from successful completion.
    pub result: Option<serde_json::Value>,
}

/// Parameters for inserting a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Unique identifier for the job.
    pub id: String,
    /// Queue to enqueue into.
    pub queue_name: String,
    /// Opaque job payload.
    pub data: serde_json::Value,
    /// Higher priority jobs are claimed first.
    pub priority: i32,
    /// Maximum attempts before permanent failure.
    pub max_attempts: i32,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
    /// Earliest time the job is eligible to be claimed.
    pub scheduled_for: DateTime<Utc>,
}

/// Case record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CaseRecord {
    /// Unique identifier for the case.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Pipeline-level status (pending, processing, completed, failed).
    pub processing_status: String,
    /// Concise human-readable detail accompanying a failed status.
    pub status_detail: Option<String>,
    /// When the case was first seen.
    pub created_at: DateTime<Utc>,
    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

/// Stage checkpoint record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StageRecord {
    /// Case this stage belongs to.
    pub case_id: String,
    /// Stage name (one of the closed set in [`crate::pipeline::StageKind`]).
    pub stage: String,
    /// Stage status (pending, running, completed, failed).
    pub status: String,
    /// Checkpointed stage output.
    pub output: Option<serde_json::Value>,
    /// When the stage started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Error message if the stage failed.
    pub error: Option<String>,
}

/// Per-status job counts for a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    /// Jobs waiting to be claimed.
    pub pending: i64,
    /// Jobs currently leased.
    pub processing: i64,
    /// Jobs finished successfully.
    pub completed: i64,
    /// Jobs permanently failed.
    pub failed: i64,
}

/// Outcome of a rate-window admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The call was admitted and recorded against the window.
    Admitted,
    /// The window is at capacity; retry after it rolls over.
    Denied {
        /// Start of the window currently at capacity.
        window_start: DateTime<Utc>,
    },
}

/// Persistence interface used by the queue, orchestrator, rate limiter, and
/// notifier.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ========================================================================
    // Jobs
    // ========================================================================

    /// Insert a new pending job.
    async fn insert_job(&self, job: &NewJob) -> Result<(), CoreError>;

    /// Fetch a job by id.
    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, CoreError>;

    /// Atomically claim the next eligible job in a queue.
    ///
    /// Eligible means `status = 'pending'` and `scheduled_for <= now`,
    /// ordered by priority descending then created_at ascending. The claim is
    /// a single conditional update keyed on the prior status, so two
    /// concurrent callers can never both claim the same job. Returns `None`
    /// when no eligible job exists; that is a normal outcome, not an error.
    async fn claim_next_job(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, CoreError>;

    /// Complete a job, only if its current status is 'processing'.
    ///
    /// Returns true if the update was applied, false if the guard rejected it.
    async fn complete_job(
        &self,
        job_id: &str,
        result: &serde_json::Value,
    ) -> Result<bool, CoreError>;

    /// Return a job to 'pending' for a later retry, incrementing attempts and
    /// pushing `scheduled_for` forward. Guarded on status = 'processing'.
    async fn retry_job(
        &self,
        job_id: &str,
        error: &str,
        scheduled_for: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Permanently fail a job, incrementing attempts and recording the error.
    /// Guarded on status = 'processing'.
    async fn fail_job(&self, job_id: &str, error: &str) -> Result<bool, CoreError>;

    /// Per-status job counts for a queue.
    async fn queue_stats(&self, queue_name: &str) -> Result<QueueStats, CoreError>;

    /// Delete terminal (failed or completed) jobs older than the cutoff.
    /// Returns the count removed.
    async fn delete_terminal_jobs_older_than(
        &self,
        queue_name: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, CoreError>;

    // ========================================================================
    // Cases
    // ========================================================================

    /// Fetch a case by id.
    async fn get_case(&self, case_id: &str) -> Result<Option<CaseRecord>, CoreError>;

    /// Create a case record if it does not exist yet.
    async fn upsert_case(&self, case_id: &str, user_id: &str) -> Result<(), CoreError>;

    /// Write the case-level processing status and optional detail.
    ///
    /// This is the durable status write that polling consumers read; it must
    /// never fail silently.
    async fn set_case_status(
        &self,
        case_id: &str,
        status: &str,
        detail: Option<&str>,
    ) -> Result<(), CoreError>;

    // ========================================================================
    // Stage checkpoints
    // ========================================================================

    /// Mark a stage as running, clearing any output from a previous run.
    async fn mark_stage_running(&self, case_id: &str, stage: &str) -> Result<(), CoreError>;

    /// Checkpoint a stage's output. Called immediately on stage success,
    /// independent of whether later stages succeed.
    async fn save_stage_output(
        &self,
        case_id: &str,
        stage: &str,
        output: &serde_json::Value,
    ) -> Result<(), CoreError>;

    /// Mark a stage as failed with an error message. Prior stages' saved
    /// outputs are left untouched.
    async fn mark_stage_failed(
        &self,
        case_id: &str,
        stage: &str,
        error: &str,
    ) -> Result<(), CoreError>;

    /// List all stage records for a case in stage-plan order of insertion.
    async fn list_stages(&self, case_id: &str) -> Result<Vec<StageRecord>, CoreError>;

    /// Delete all stage records for a case (full pipeline re-run).
    async fn clear_stages(&self, case_id: &str) -> Result<(), CoreError>;

    // ========================================================================
    // Rate windows
    // ========================================================================

    /// Attempt to record one request plus `tokens` estimated tokens against
    /// the resource's rolling window.
    ///
    /// The increment is guarded in the WHERE clause (increment-if-under-limit)
    /// so concurrent invocations cannot over-admit past the configured
    /// ceilings. An expired window (started more than 60 seconds ago) is reset
    /// before the guarded increment.
    async fn try_admit(
        &self,
        resource: &str,
        now: DateTime<Utc>,
        tokens: i64,
        rpm_limit: i64,
        tpm_limit: i64,
    ) -> Result<RateDecision, CoreError>;

    // ========================================================================
    // Health
    // ========================================================================

    /// Check that the database is reachable.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}

/// Connect to the configured database, run migrations, and return the
/// matching persistence backend.
///
/// URLs beginning with `sqlite:` select the SQLite backend; anything else is
/// treated as PostgreSQL.
pub async fn connect(database_url: &str) -> Result<Arc<dyn Persistence>, CoreError> {
    if database_url.starts_with("sqlite:") {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| CoreError::Database {
                operation: "connect".to_string(),
                details: format!("failed to connect to {}: {}", database_url, e),
            })?;
        crate::migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CoreError::Database {
                operation: "migrate".to_string(),
                details: e.to_string(),
            })?;
        Ok(Arc::new(SqlitePersistence::new(pool)))
    } else {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| CoreError::Database {
                operation: "connect".to_string(),
                details: format!("failed to connect to database: {}", e),
            })?;
        crate::migrations::run_postgres(&pool)
            .await
            .map_err(|e| CoreError::Database {
                operation: "migrate".to_string(),
                details: e.to_string(),
            })?;
        Ok(Arc::new(PostgresPersistence::new(pool)))
    }
}
