use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::domain::Job;
use crate::payout::PayoutBreakdown;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateJobRequest {
    #[validate(length(min = 1, max = 64, message = "Requester id must be 1-64 characters"))]
    pub requester_id: String,
    pub scheduled_at: DateTime<Utc>,
    #[validate(range(min = 1, max = 1440, message = "Duration must be between 1 and 1440 minutes"))]
    pub duration_minutes: i64,
    #[validate(range(min = 1, message = "Gross price must be a positive amount in minor units"))]
    pub gross_price_minor: i64,
    /// Platform fee as a decimal fraction (0.20 = 20%). The policy default
    /// applies when absent.
    #[validate(range(min = 0.0, max = 0.99, message = "Fee rate must be below 1.0"))]
    pub fee_rate_percent: Option<f64>,
    #[serde(default)]
    pub add_ons: Vec<String>,
    #[validate(length(min = 1, message = "Address must not be empty"))]
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct FulfillerRequest {
    #[validate(length(min = 1, max = 64, message = "Fulfiller id must be 1-64 characters"))]
    pub fulfiller_id: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct DelayRequest {
    #[validate(length(min = 1, max = 64, message = "Fulfiller id must be 1-64 characters"))]
    pub fulfiller_id: String,
    #[validate(range(min = 1, max = 720, message = "Delay must be between 1 and 720 minutes"))]
    pub minutes: i64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CancelRequest {
    #[validate(length(min = 1, max = 64, message = "Acting party must be 1-64 characters"))]
    pub acting_party: String,
    #[validate(length(min = 1, max = 500, message = "Reason must be 1-500 characters"))]
    pub reason: String,
}

/// Response for operations that return the updated job.
#[derive(Serialize)]
pub struct JobResponse {
    pub message: String,
    pub job: Job,
}

/// Response for `complete`: the job plus its settled payout breakdown.
#[derive(Serialize)]
pub struct CompletionResponse {
    pub message: String,
    pub job: Job,
    pub payout: PayoutBreakdown,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}
