use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

use crate::domain::{
    Job, JobStatus, Location, OnboardingPlan, OnboardingState, StageThresholds, VerificationStatus,
};

/// Database representation of a job row.
#[derive(Debug, FromRow, Serialize)]
pub struct JobRow {
    pub id: String,
    pub status: String,
    pub requester_id: String,
    pub fulfiller_id: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub gross_price_minor: i64,
    pub fee_rate_bp: i64,
    pub add_ons: Vec<String>,
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobRow {
    pub fn into_job(self) -> Result<Job, String> {
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| format!("unknown status '{}' on job {}", self.status, self.id))?;
        Ok(Job {
            id: self.id,
            status,
            requester_id: self.requester_id,
            fulfiller_id: self.fulfiller_id,
            scheduled_at: self.scheduled_at,
            duration_minutes: self.duration_minutes,
            gross_price_minor: self.gross_price_minor,
            fee_rate_bp: self.fee_rate_bp,
            add_ons: self.add_ons,
            location: Location {
                address: self.address,
                latitude: self.latitude,
                longitude: self.longitude,
            },
            created_at: self.created_at,
            accepted_at: self.accepted_at,
            completed_at: self.completed_at,
            cancel_reason: self.cancel_reason,
        })
    }
}

/// Database representation of a provider's onboarding progress. The
/// `stage_label` column is a query-convenience cache; reads recompute the
/// label from step position instead of trusting it.
#[derive(Debug, FromRow, Serialize)]
pub struct OnboardingRow {
    pub provider_id: String,
    pub current_step: i32,
    pub total_steps: i32,
    pub service_defined_at: i32,
    pub live_at: i32,
    pub is_complete: bool,
    pub activated: bool,
    pub verified_since: Option<DateTime<Utc>>,
    pub stage_label: String,
    pub updated_at: DateTime<Utc>,
}

impl OnboardingRow {
    pub fn into_state(self) -> OnboardingState {
        OnboardingState {
            provider_id: self.provider_id,
            current_step: self.current_step,
            plan: OnboardingPlan {
                total_steps: self.total_steps,
                thresholds: StageThresholds {
                    service_defined: self.service_defined_at,
                    live: self.live_at,
                },
            },
            is_complete: self.is_complete,
            activated: self.activated,
            verification: match self.verified_since {
                Some(since) => VerificationStatus::Verified { since },
                None => VerificationStatus::Unverified,
            },
            updated_at: self.updated_at,
        }
    }
}

/// A deferred settlement waiting in the retry queue.
#[derive(Debug, FromRow)]
pub struct SettlementQueueRow {
    pub job_id: String,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
}
