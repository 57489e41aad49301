use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Job, JobStatus, OnboardingPlan, OnboardingState};

/// Failure of a storage collaborator call.
#[derive(Debug)]
pub enum StoreError {
    /// No row for that id.
    NotFound,
    /// The conditional write found a different status than expected.
    /// Carries what the row actually held so callers can classify the race.
    Conflict { actual: JobStatus },
    /// A guard condition on the row refused the write (completed state is
    /// read-only, completion before the final step). Not retryable.
    Refused(String),
    /// Timeout / connectivity / backend error. Retryable with backoff.
    Unavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "record not found"),
            StoreError::Conflict { actual } => {
                write!(f, "conditional write lost: status is {}", actual.as_str())
            }
            StoreError::Refused(msg) => write!(f, "write refused: {}", msg),
            StoreError::Unavailable(msg) => write!(f, "storage unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Fields set alongside a status swap. Absent fields are left untouched.
#[derive(Debug, Default, Clone)]
pub struct StatusFields {
    pub fulfiller_id: Option<String>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

/// Audit record written for declines and money-affecting failures; the raw
/// material of manual reconciliation.
#[derive(Debug, Clone)]
pub struct JobAuditEntry {
    pub job_id: String,
    pub actor: String,
    pub action: String,
    pub expected_status: Option<JobStatus>,
    pub actual_status: Option<JobStatus>,
    pub detail: String,
}

/// The one interface the lifecycle engine trusts for truth.
///
/// `conditional_update_status` is the load-bearing call: it must perform
/// the compare-expected-status-then-set as a single atomic operation, since
/// multiple devices and providers act on the same job concurrently.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_job(&self, job_id: &str) -> Result<Job, StoreError>;

    async fn insert_job(&self, job: &Job) -> Result<Job, StoreError>;

    async fn conditional_update_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        new: JobStatus,
        fields: StatusFields,
    ) -> Result<Job, StoreError>;

    async fn record_audit(&self, entry: JobAuditEntry) -> Result<(), StoreError>;
}

/// Persistence for onboarding progress. Monotonicity is enforced at the
/// storage layer (`GREATEST`/`LEAST` upserts) so concurrent sessions of the
/// same provider converge instead of clobbering each other.
#[async_trait]
pub trait OnboardingStore: Send + Sync {
    async fn get(&self, provider_id: &str) -> Result<Option<OnboardingState>, StoreError>;

    /// Create-or-raise: first touch creates the row under `plan`; later
    /// calls only ever raise `current_step`, never lower it.
    async fn advance(
        &self,
        provider_id: &str,
        to_step: i32,
        plan: &OnboardingPlan,
    ) -> Result<OnboardingState, StoreError>;

    /// Lower `current_step`, refused once the state is complete. Returns
    /// `Conflict` when completion has frozen the row.
    async fn rewind(&self, provider_id: &str, to_step: i32) -> Result<OnboardingState, StoreError>;

    /// Flip `is_complete` and record verification; only valid when
    /// `current_step == total_steps`, and idempotent once set.
    async fn mark_complete(
        &self,
        provider_id: &str,
        verified_since: DateTime<Utc>,
    ) -> Result<OnboardingState, StoreError>;

    /// Activation gate into the live tier; requires a complete state.
    async fn mark_activated(&self, provider_id: &str) -> Result<OnboardingState, StoreError>;

    /// Refresh the redundant stage cache column. Best effort; the cache is
    /// never read back as truth.
    async fn refresh_stage_cache(&self, provider_id: &str, label: &str) -> Result<(), StoreError>;
}
