//! Durable job rows backing the task queue
//!
//! The `jobs` table is the broker: submission inserts a `queued` row, workers
//! claim with a single compare-and-swap update, and every state transition is
//! its own short transaction so a crashed worker never wedges the queue.

use super::{format_ts, parse_ts, Store};
use crate::error::{CoreError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// Queue lifecycle of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One durable job row
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobRow {
    pub job_id: Uuid,
    pub tenant: String,
    pub job_type: String,
    pub args: Value,
    pub status: JobStatus,
    pub progress: i64,
    pub attempts: i64,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<JobRow> {
    let job_id: String = row.get("job_id");
    let args: String = row.get("args");
    let status: String = row.get("status");
    let result: Option<String> = row.get("result");
    let created_at: String = row.get("created_at");
    let started_at: Option<String> = row.get("started_at");
    let completed_at: Option<String> = row.get("completed_at");

    Ok(JobRow {
        job_id: Uuid::parse_str(&job_id)
            .map_err(|e| CoreError::Database(sqlx::Error::Decode(e.into())))?,
        tenant: row.get("tenant"),
        job_type: row.get("job_type"),
        args: serde_json::from_str(&args).unwrap_or(Value::Null),
        status: JobStatus::parse(&status)
            .ok_or_else(|| CoreError::Validation(format!("unknown job status {}", status)))?,
        progress: row.get("progress"),
        attempts: row.get("attempts"),
        result: result.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get("error"),
        cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
        created_at: parse_ts(&created_at),
        started_at: started_at.as_deref().map(parse_ts),
        completed_at: completed_at.as_deref().map(parse_ts),
    })
}

impl Store {
    /// Persist a new job in `queued` before any worker can see it
    pub async fn insert_job(
        &self,
        tenant: &str,
        job_type: &str,
        args: &Value,
    ) -> Result<Uuid> {
        let job_id = Uuid::new_v4();
        let now = format_ts(Utc::now());

        sqlx::query(
            r#"
            INSERT INTO jobs (job_id, tenant, job_type, args, status,
                              created_at, next_run_at)
            VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?5)
            "#,
        )
        .bind(job_id.to_string())
        .bind(tenant)
        .bind(job_type)
        .bind(args.to_string())
        .bind(&now)
        .execute(self.pool())
        .await?;

        debug!(job = %job_id, job_type, "job queued");
        Ok(job_id)
    }

    /// Claim the oldest due queued job; the update is the mutual exclusion
    pub async fn claim_next_job(&self) -> Result<Option<JobRow>> {
        let now = format_ts(Utc::now());
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running', started_at = ?1, attempts = attempts + 1
            WHERE job_id = (
                SELECT job_id FROM jobs
                WHERE status = 'queued' AND next_run_at <= ?1
                ORDER BY next_run_at ASC, created_at ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(&now)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(row_to_job).transpose()
    }

    /// Report progress; values never go backwards
    pub async fn set_job_progress(&self, job_id: Uuid, progress: i64) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET progress = MAX(progress, ?1) WHERE job_id = ?2",
        )
        .bind(progress.clamp(0, 100))
        .bind(job_id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Terminal success
    pub async fn complete_job(&self, job_id: Uuid, result: &Value) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', progress = 100, result = ?1,
                completed_at = ?2
            WHERE job_id = ?3
            "#,
        )
        .bind(result.to_string())
        .bind(format_ts(Utc::now()))
        .bind(job_id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Terminal failure with a human-readable error
    pub async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', error = ?1, completed_at = ?2
            WHERE job_id = ?3
            "#,
        )
        .bind(error)
        .bind(format_ts(Utc::now()))
        .bind(job_id.to_string())
        .execute(self.pool())
        .await?;
        warn!(job = %job_id, error, "job failed");
        Ok(())
    }

    /// Put a job back in the queue after a transient failure
    pub async fn requeue_job(&self, job_id: Uuid, delay: std::time::Duration) -> Result<()> {
        let next = Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default();
        sqlx::query(
            "UPDATE jobs SET status = 'queued', next_run_at = ?1 WHERE job_id = ?2",
        )
        .bind(format_ts(next))
        .bind(job_id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Fetch one job scoped to a tenant
    pub async fn get_job(&self, tenant: &str, job_id: Uuid) -> Result<Option<JobRow>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ?1 AND tenant = ?2")
            .bind(job_id.to_string())
            .bind(tenant)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    /// Flag a running job for cooperative cancellation
    pub async fn request_job_cancel(&self, tenant: &str, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET cancel_requested = 1
             WHERE job_id = ?1 AND tenant = ?2 AND status IN ('queued', 'running')",
        )
        .bind(job_id.to_string())
        .bind(tenant)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Checked by workers between pipeline states
    pub async fn job_cancel_requested(&self, job_id: Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT cancel_requested FROM jobs WHERE job_id = ?1")
            .bind(job_id.to_string())
            .fetch_optional(self.pool())
            .await?;
        Ok(row
            .map(|r| r.get::<i64, _>("cancel_requested") != 0)
            .unwrap_or(false))
    }

    /// Requeue `running` jobs whose worker disappeared
    pub async fn requeue_stale_jobs(&self, visibility: std::time::Duration) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::from_std(visibility).unwrap_or_default();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', next_run_at = ?1
            WHERE status = 'running' AND started_at < ?2
            "#,
        )
        .bind(format_ts(Utc::now()))
        .bind(format_ts(cutoff))
        .execute(self.pool())
        .await?;

        if result.rows_affected() > 0 {
            warn!(count = result.rows_affected(), "requeued stale running jobs");
        }
        Ok(result.rows_affected())
    }

    /// Job counts per status for a tenant
    pub async fn job_counts(&self, tenant: &str) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM jobs WHERE tenant = ?1 GROUP BY status",
        )
        .bind(tenant)
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("status"), row.get::<i64, _>("n")))
            .collect())
    }

    /// Depth of the queue, used by the health check
    pub async fn queued_job_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs WHERE status = 'queued'")
            .fetch_one(self.pool())
            .await?;
        Ok(row.get("n"))
    }
}
