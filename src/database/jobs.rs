// ABOUTME: Durable job row operations backing the retry queue
// ABOUTME: Claiming is a single atomic UPDATE..RETURNING so workers never double-claim
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

use super::Database;
use crate::errors::{AppError, AppResult};
use crate::queue::job::{JobKind, JobRecord, JobStatus};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

impl Database {
    /// Insert a new waiting job
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_job(&self, job: &JobRecord) -> AppResult<()> {
        sqlx::query(
            r"
            INSERT INTO jobs (
                id, queue, kind, payload, status, attempts, max_attempts,
                backoff_base_ms, run_at, last_error, created_at, updated_at, finished_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ",
        )
        .bind(job.id.to_string())
        .bind(&job.queue)
        .bind(job.kind.as_str())
        .bind(job.payload.to_string())
        .bind(job.status.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_attempts))
        .bind(i64::try_from(job.backoff_base_ms).unwrap_or(i64::MAX))
        .bind(job.run_at)
        .bind(job.last_error.as_deref())
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.finished_at)
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to insert job: {e}")))?;

        Ok(())
    }

    /// Atomically claim the next due job on a queue. Transitions
    /// `waiting → active` and bumps `attempts` in the same statement, so two
    /// workers polling the same queue can never claim the same row.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the claimed row is malformed.
    pub async fn claim_due_job(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<JobRecord>> {
        let row = sqlx::query(
            r"
            UPDATE jobs
            SET status = 'active', attempts = attempts + 1, updated_at = $2
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = $1 AND status = 'waiting' AND run_at <= $2
                ORDER BY run_at ASC
                LIMIT 1
            )
            RETURNING id, queue, kind, payload, status, attempts, max_attempts,
                      backoff_base_ms, run_at, last_error, created_at, updated_at, finished_at
            ",
        )
        .bind(queue)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to claim job: {e}")))?;

        row.map_or_else(|| Ok(None), |row| Ok(Some(row_to_job(&row)?)))
    }

    /// Mark a job as terminally completed
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn complete_job(&self, job_id: Uuid) -> AppResult<()> {
        let now = Utc::now();
        sqlx::query(
            r"
            UPDATE jobs
            SET status = 'completed', updated_at = $2, finished_at = $2
            WHERE id = $1
            ",
        )
        .bind(job_id.to_string())
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to complete job: {e}")))?;

        Ok(())
    }

    /// Reschedule a failed job for another attempt
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn reschedule_job(
        &self,
        job_id: Uuid,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> AppResult<()> {
        sqlx::query(
            r"
            UPDATE jobs
            SET status = 'waiting', run_at = $2, last_error = $3, updated_at = $4
            WHERE id = $1
            ",
        )
        .bind(job_id.to_string())
        .bind(run_at)
        .bind(error)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to reschedule job: {e}")))?;

        Ok(())
    }

    /// Park a job in the dead-letter state after exhausting attempts
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn dead_letter_job(&self, job_id: Uuid, error: &str) -> AppResult<()> {
        let now = Utc::now();
        sqlx::query(
            r"
            UPDATE jobs
            SET status = 'dead_letter', last_error = $2, updated_at = $3, finished_at = $3
            WHERE id = $1
            ",
        )
        .bind(job_id.to_string())
        .bind(error)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to dead-letter job: {e}")))?;

        Ok(())
    }

    /// Get a job by ID
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row is malformed.
    pub async fn get_job(&self, job_id: Uuid) -> AppResult<Option<JobRecord>> {
        let row = sqlx::query(
            r"
            SELECT id, queue, kind, payload, status, attempts, max_attempts,
                   backoff_base_ms, run_at, last_error, created_at, updated_at, finished_at
            FROM jobs
            WHERE id = $1
            ",
        )
        .bind(job_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to query job: {e}")))?;

        row.map_or_else(|| Ok(None), |row| Ok(Some(row_to_job(&row)?)))
    }

    /// List jobs on a queue filtered by status, oldest first
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_jobs(&self, queue: &str, status: JobStatus) -> AppResult<Vec<JobRecord>> {
        let rows = sqlx::query(
            r"
            SELECT id, queue, kind, payload, status, attempts, max_attempts,
                   backoff_base_ms, run_at, last_error, created_at, updated_at, finished_at
            FROM jobs
            WHERE queue = $1 AND status = $2
            ORDER BY created_at ASC
            ",
        )
        .bind(queue)
        .bind(status.as_str())
        .fetch_all(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to list jobs: {e}")))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    /// Delete terminal jobs older than the cutoff (bounded retention)
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn prune_finished_jobs(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM jobs
            WHERE status IN ('completed', 'dead_letter') AND finished_at < $1
            ",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to prune jobs: {e}")))?;

        Ok(result.rows_affected())
    }
}

/// Convert a database row to a `JobRecord`
fn row_to_job(row: &SqliteRow) -> AppResult<JobRecord> {
    let id_str: String = row.get("id");
    let kind_str: String = row.get("kind");
    let status_str: String = row.get("status");
    let payload_str: String = row.get("payload");
    let attempts: i64 = row.get("attempts");
    let max_attempts: i64 = row.get("max_attempts");
    let backoff_base_ms: i64 = row.get("backoff_base_ms");

    Ok(JobRecord {
        id: Uuid::parse_str(&id_str)?,
        queue: row.get("queue"),
        kind: JobKind::from_str_value(&kind_str)
            .ok_or_else(|| AppError::database(format!("Invalid job kind: {kind_str}")))?,
        payload: serde_json::from_str(&payload_str)
            .map_err(|e| AppError::database(format!("Invalid job payload: {e}")))?,
        status: JobStatus::from_str_value(&status_str)
            .ok_or_else(|| AppError::database(format!("Invalid job status: {status_str}")))?,
        attempts: u32::try_from(attempts)
            .map_err(|e| AppError::database(format!("Invalid attempts: {e}")))?,
        max_attempts: u32::try_from(max_attempts)
            .map_err(|e| AppError::database(format!("Invalid max attempts: {e}")))?,
        backoff_base_ms: u64::try_from(backoff_base_ms)
            .map_err(|e| AppError::database(format!("Invalid backoff: {e}")))?,
        run_at: row.get("run_at"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        finished_at: row.get("finished_at"),
    })
}
