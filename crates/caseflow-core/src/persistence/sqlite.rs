//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::CoreError;

use super::{
    CaseRecord, JobRecord, NewJob, Persistence, QueueStats, RateDecision, StageRecord,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const JOB_COLUMNS: &str = "id, queue_name, data, status, priority, attempts, max_attempts, \
     created_at, scheduled_for, started_at, completed_at, failed_at, error, result";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, connects
    /// with sensible defaults, and runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Database {
                operation: "create_dir".to_string(),
                details: format!("failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let path_str = path.to_string_lossy();
        let url = format!("sqlite:{}?mode=rwc", path_str);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::Database {
                operation: "connect".to_string(),
                details: format!("failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::Database {
                operation: "migrate".to_string(),
                details: format!("failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// Access the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_job(&self, job: &NewJob) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, queue_name, data, status, priority, attempts, max_attempts,
                              created_at, scheduled_for)
            VALUES (?, ?, ?, 'pending', ?, 0, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.queue_name)
        .bind(&job.data)
        .bind(job.priority)
        .bind(job.max_attempts)
        .bind(job.created_at)
        .bind(job.scheduled_for)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, CoreError> {
        let record = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn claim_next_job(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, CoreError> {
        // Single conditional update: the status guard in the outer WHERE makes
        // the claim atomic even though the candidate is picked in a subquery.
        let record = sqlx::query_as::<_, JobRecord>(&format!(
            r#"
            UPDATE jobs
            SET status = 'processing', started_at = ?2
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue_name = ?1 AND status = 'pending' AND scheduled_for <= ?2
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
            )
              AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(queue_name)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn complete_job(
        &self,
        job_id: &str,
        result: &serde_json::Value,
    ) -> Result<bool, CoreError> {
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', completed_at = ?1, result = ?2
            WHERE id = ?3 AND status = 'processing'
            "#,
        )
        .bind(Utc::now())
        .bind(result)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected() > 0)
    }

    async fn retry_job(
        &self,
        job_id: &str,
        error: &str,
        scheduled_for: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', attempts = attempts + 1, error = ?1,
                scheduled_for = ?2, started_at = NULL
            WHERE id = ?3 AND status = 'processing'
            "#,
        )
        .bind(error)
        .bind(scheduled_for)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected() > 0)
    }

    async fn fail_job(&self, job_id: &str, error: &str) -> Result<bool, CoreError> {
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', attempts = attempts + 1, error = ?1, failed_at = ?2
            WHERE id = ?3 AND status = 'processing'
            "#,
        )
        .bind(error)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected() > 0)
    }

    async fn queue_stats(&self, queue_name: &str) -> Result<QueueStats, CoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM jobs
            WHERE queue_name = ?
            GROUP BY status
            "#,
        )
        .bind(queue_name)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => stats.pending = count,
                "processing" => stats.processing = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                _ => {}
            }
        }

        Ok(stats)
    }

    async fn delete_terminal_jobs_older_than(
        &self,
        queue_name: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        let done = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE queue_name = ?1
              AND (
                    (status = 'failed' AND failed_at < ?2)
                 OR (status = 'completed' AND completed_at < ?2)
              )
            "#,
        )
        .bind(queue_name)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected())
    }

    async fn get_case(&self, case_id: &str) -> Result<Option<CaseRecord>, CoreError> {
        let record = sqlx::query_as::<_, CaseRecord>(
            r#"
            SELECT id, user_id, processing_status, status_detail, created_at, updated_at
            FROM cases
            WHERE id = ?
            "#,
        )
        .bind(case_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn upsert_case(&self, case_id: &str, user_id: &str) -> Result<(), CoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO cases (id, user_id, processing_status, created_at, updated_at)
            VALUES (?1, ?2, 'pending', ?3, ?3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(case_id)
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_case_status(
        &self,
        case_id: &str,
        status: &str,
        detail: Option<&str>,
    ) -> Result<(), CoreError> {
        let done = sqlx::query(
            r#"
            UPDATE cases
            SET processing_status = ?1, status_detail = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(status)
        .bind(detail)
        .bind(Utc::now())
        .bind(case_id)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(CoreError::CaseNotFound {
                case_id: case_id.to_string(),
            });
        }

        Ok(())
    }

    async fn mark_stage_running(&self, case_id: &str, stage: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO case_stages (case_id, stage, status, started_at)
            VALUES (?1, ?2, 'running', ?3)
            ON CONFLICT (case_id, stage) DO UPDATE
            SET status = 'running', started_at = ?3, completed_at = NULL,
                output = NULL, error = NULL
            "#,
        )
        .bind(case_id)
        .bind(stage)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_stage_output(
        &self,
        case_id: &str,
        stage: &str,
        output: &serde_json::Value,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE case_stages
            SET status = 'completed', output = ?1, completed_at = ?2, error = NULL
            WHERE case_id = ?3 AND stage = ?4
            "#,
        )
        .bind(output)
        .bind(Utc::now())
        .bind(case_id)
        .bind(stage)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_stage_failed(
        &self,
        case_id: &str,
        stage: &str,
        error: &str,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE case_stages
            SET status = 'failed', error = ?1, completed_at = ?2
            WHERE case_id = ?3 AND stage = ?4
            "#,
        )
        .bind(error)
        .bind(Utc::now())
        .bind(case_id)
        .bind(stage)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_stages(&self, case_id: &str) -> Result<Vec<StageRecord>, CoreError> {
        let rows = sqlx::query_as::<_, StageRecord>(
            r#"
            SELECT case_id, stage, status, output, started_at, completed_at, error
            FROM case_stages
            WHERE case_id = ?
            ORDER BY started_at ASC
            "#,
        )
        .bind(case_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn clear_stages(&self, case_id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM case_stages WHERE case_id = ?")
            .bind(case_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn try_admit(
        &self,
        resource: &str,
        now: DateTime<Utc>,
        tokens: i64,
        rpm_limit: i64,
        tpm_limit: i64,
    ) -> Result<RateDecision, CoreError> {
        let window_floor = now - ChronoDuration::seconds(60);

        // Ensure a window row exists.
        sqlx::query(
            r#"
            INSERT INTO rate_windows (resource, window_start, request_count, token_count)
            VALUES (?1, ?2, 0, 0)
            ON CONFLICT (resource) DO NOTHING
            "#,
        )
        .bind(resource)
        .bind(now)
        .execute(&self.pool)
        .await?;

        // Reset an expired window. Racing resets both write fresh counters,
        // so the guarded increment below stays conservative.
        sqlx::query(
            r#"
            UPDATE rate_windows
            SET window_start = ?1, request_count = 0, token_count = 0
            WHERE resource = ?2 AND window_start <= ?3
            "#,
        )
        .bind(now)
        .bind(resource)
        .bind(window_floor)
        .execute(&self.pool)
        .await?;

        // Guarded increment: admit only if both ceilings hold after the add.
        let done = sqlx::query(
            r#"
            UPDATE rate_windows
            SET request_count = request_count + 1, token_count = token_count + ?1
            WHERE resource = ?2
              AND request_count + 1 <= ?3
              AND token_count + ?1 <= ?4
            "#,
        )
        .bind(tokens)
        .bind(resource)
        .bind(rpm_limit)
        .bind(tpm_limit)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() > 0 {
            return Ok(RateDecision::Admitted);
        }

        let (window_start,): (DateTime<Utc>,) =
            sqlx::query_as("SELECT window_start FROM rate_windows WHERE resource = ?")
                .bind(resource)
                .fetch_one(&self.pool)
                .await?;

        Ok(RateDecision::Denied { window_start })
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
