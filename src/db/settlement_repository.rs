use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use tracing::debug;

use crate::collaborators::settlement::{DeferredSettlement, LedgerError, SettlementLedger};
use crate::db::models::SettlementQueueRow;
use crate::payout::PayoutBreakdown;

/// How long a claimed queue entry is leased to one worker before another
/// may pick it up again.
const CLAIM_LEASE_SECONDS: i32 = 120;

/// Postgres-backed settlement ledger and deferred-settlement queue.
pub struct SettlementRepository {
    pool: Pool<Postgres>,
}

impl SettlementRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn map_sqlx(err: sqlx::Error) -> LedgerError {
        LedgerError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl SettlementLedger for SettlementRepository {
    /// Keyed by job id: the second and every later attempt hits the
    /// conflict arm and records nothing, which is exactly the
    /// one-settlement-per-completed-job contract.
    async fn record_settlement(
        &self,
        job_id: &str,
        breakdown: &PayoutBreakdown,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO settlements
                (job_id, gross_price_minor, platform_fee_minor, net_payout_minor,
                 hourly_rate_minor, duration_minutes, fee_rate_bp, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(breakdown.gross_price_minor)
        .bind(breakdown.platform_fee_minor)
        .bind(breakdown.net_payout_minor)
        .bind(breakdown.hourly_rate_minor)
        .bind(breakdown.duration_minutes)
        .bind(breakdown.fee_rate_bp)
        .execute(&self.pool)
        .await
        .map_err(Self::map_sqlx)?;
        debug!(job_id, net = breakdown.net_payout_minor, "settlement recorded");
        Ok(())
    }

    async fn defer(&self, job_id: &str, reason: &str) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO settlement_queue (job_id, attempts, last_error, next_attempt_at)
            VALUES ($1, 1, $2, NOW())
            ON CONFLICT (job_id) DO UPDATE SET
                attempts = settlement_queue.attempts + 1,
                last_error = EXCLUDED.last_error
            "#,
        )
        .bind(job_id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(Self::map_sqlx)?;
        Ok(())
    }

    /// Claim due entries with a lease: the subselect locks the rows
    /// (skipping ones another worker holds) and the update pushes their
    /// next attempt past the lease window.
    async fn claim_due(&self, limit: i64) -> Result<Vec<DeferredSettlement>, LedgerError> {
        let rows = sqlx::query_as::<_, SettlementQueueRow>(
            r#"
            UPDATE settlement_queue
            SET attempts = attempts + 1,
                next_attempt_at = NOW() + make_interval(secs => $2)
            WHERE job_id IN (
                SELECT job_id FROM settlement_queue
                WHERE next_attempt_at <= NOW()
                ORDER BY next_attempt_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING job_id, attempts, next_attempt_at
            "#,
        )
        .bind(limit)
        .bind(CLAIM_LEASE_SECONDS as f64)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::map_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|row| DeferredSettlement {
                job_id: row.job_id,
                attempts: row.attempts,
                next_attempt_at: row.next_attempt_at,
            })
            .collect())
    }

    async fn resolve(&self, job_id: &str) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM settlement_queue WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(Self::map_sqlx)?;
        Ok(())
    }
}
