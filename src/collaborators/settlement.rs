use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::payout::PayoutBreakdown;

#[derive(Debug)]
pub enum LedgerError {
    /// The settlement party refused the record. Not retryable as-is; the
    /// job must stay `in_progress` until resolved.
    Rejected(String),
    /// Timeout / connectivity. Retryable; may be deferred to the queue.
    Unavailable(String),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Rejected(msg) => write!(f, "settlement rejected: {}", msg),
            LedgerError::Unavailable(msg) => write!(f, "settlement backend unavailable: {}", msg),
        }
    }
}

impl std::error::Error for LedgerError {}

/// A settlement the engine could not record synchronously, parked for the
/// retry worker.
#[derive(Debug, Clone)]
pub struct DeferredSettlement {
    pub job_id: String,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
}

/// Payment/settlement collaborator. `record_settlement` is keyed by job id
/// and must be idempotent: one completed job, one settlement record, no
/// matter how many times completion is retried.
#[async_trait]
pub trait SettlementLedger: Send + Sync {
    async fn record_settlement(
        &self,
        job_id: &str,
        breakdown: &PayoutBreakdown,
    ) -> Result<(), LedgerError>;

    /// Park a settlement for the retry worker after synchronous attempts
    /// are exhausted.
    async fn defer(&self, job_id: &str, reason: &str) -> Result<(), LedgerError>;

    /// Claim up to `limit` due deferred settlements, pushing their next
    /// attempt into the future so concurrent workers do not double-claim.
    async fn claim_due(&self, limit: i64) -> Result<Vec<DeferredSettlement>, LedgerError>;

    /// Drop a queue entry once its settlement is recorded.
    async fn resolve(&self, job_id: &str) -> Result<(), LedgerError>;
}
