use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use tracing::debug;

use crate::collaborators::storage::{JobAuditEntry, JobStore, StatusFields, StoreError};
use crate::db::models::JobRow;
use crate::domain::{Job, JobStatus};

const JOB_COLUMNS: &str = "id, status, requester_id, fulfiller_id, scheduled_at, \
     duration_minutes, gross_price_minor, fee_rate_bp, add_ons, address, latitude, longitude, \
     created_at, accepted_at, completed_at, cancel_reason, updated_at";

/// Repository for job rows; the Postgres face of the storage collaborator.
pub struct JobRepository {
    pool: Pool<Postgres>,
}

impl JobRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn map_row(row: JobRow) -> Result<Job, StoreError> {
        row.into_job().map_err(StoreError::Unavailable)
    }

    fn map_sqlx(err: sqlx::Error) -> StoreError {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

#[async_trait]
impl JobStore for JobRepository {
    async fn get_job(&self, job_id: &str) -> Result<Job, StoreError> {
        let sql = format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS);
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::map_sqlx)?
            .ok_or(StoreError::NotFound)?;
        Self::map_row(row)
    }

    async fn insert_job(&self, job: &Job) -> Result<Job, StoreError> {
        debug!(job_id = %job.id, "inserting job");
        // Idempotent under the generated id so a retried insert after an
        // ambiguous failure cannot create a second row.
        let sql = format!(
            r#"
            INSERT INTO jobs
                (id, status, requester_id, fulfiller_id, scheduled_at, duration_minutes,
                 gross_price_minor, fee_rate_bp, add_ons, address, latitude, longitude,
                 created_at, accepted_at, completed_at, cancel_reason, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, NOW())
            ON CONFLICT (id) DO UPDATE SET updated_at = NOW()
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(&job.id)
            .bind(job.status.as_str())
            .bind(&job.requester_id)
            .bind(&job.fulfiller_id)
            .bind(job.scheduled_at)
            .bind(job.duration_minutes)
            .bind(job.gross_price_minor)
            .bind(job.fee_rate_bp)
            .bind(&job.add_ons)
            .bind(&job.location.address)
            .bind(job.location.latitude)
            .bind(job.location.longitude)
            .bind(job.created_at)
            .bind(job.accepted_at)
            .bind(job.completed_at)
            .bind(&job.cancel_reason)
            .fetch_one(&self.pool)
            .await
            .map_err(Self::map_sqlx)?;
        Self::map_row(row)
    }

    /// The single atomic compare-status-and-swap every transition rides on.
    /// The status check lives in the WHERE clause, so there is no
    /// read-modify-write window for a rival session to slip through.
    async fn conditional_update_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        new: JobStatus,
        fields: StatusFields,
    ) -> Result<Job, StoreError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = $3,
                fulfiller_id = COALESCE($4, fulfiller_id),
                accepted_at = COALESCE($5, accepted_at),
                completed_at = COALESCE($6, completed_at),
                cancel_reason = COALESCE($7, cancel_reason),
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        let updated = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id)
            .bind(expected.as_str())
            .bind(new.as_str())
            .bind(&fields.fulfiller_id)
            .bind(fields.accepted_at)
            .bind(fields.completed_at)
            .bind(&fields.cancel_reason)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::map_sqlx)?;

        match updated {
            Some(row) => {
                debug!(job_id, from = expected.as_str(), to = new.as_str(), "status swapped");
                Self::map_row(row)
            }
            None => {
                // Zero rows: either the job is gone or the status moved.
                let actual: Option<String> =
                    sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
                        .bind(job_id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(Self::map_sqlx)?;
                match actual {
                    None => Err(StoreError::NotFound),
                    Some(status) => {
                        let actual = JobStatus::parse(&status).ok_or_else(|| {
                            StoreError::Unavailable(format!(
                                "unknown status '{}' on job {}",
                                status, job_id
                            ))
                        })?;
                        Err(StoreError::Conflict { actual })
                    }
                }
            }
        }
    }

    async fn record_audit(&self, entry: JobAuditEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_audit (job_id, actor, action, expected_status, actual_status, detail)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&entry.job_id)
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(entry.expected_status.map(|s| s.as_str()))
        .bind(entry.actual_status.map(|s| s.as_str()))
        .bind(&entry.detail)
        .execute(&self.pool)
        .await
        .map_err(Self::map_sqlx)?;
        Ok(())
    }
}
