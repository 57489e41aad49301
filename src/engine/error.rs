use actix_web::{HttpResponse, ResponseError};
use std::fmt;
use tracing::{error, warn};

use crate::api::validation::ErrorResponse;
use crate::domain::JobStatus;
use crate::payout;

/// Engine-level errors for lifecycle operations.
#[derive(Debug)]
pub enum EngineError {
    /// Attempted move not allowed from the job's current state. The caller
    /// should refresh and re-display; not retryable as-is.
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        attempted: &'static str,
    },

    /// Lost the pending->accepted race to another fulfiller. The offer is
    /// gone; not a retryable condition.
    AlreadyClaimed { job_id: String },

    /// Acting party is not permitted to drive this job.
    Unauthorized { job_id: String, actor: String },

    /// Bad payout/duration/price inputs. Caller bug.
    InvalidInput(String),

    /// No job with that id.
    NotFound(String),

    /// A storage or payment collaborator stayed unreachable through the
    /// bounded retry budget.
    CollaboratorUnavailable {
        collaborator: &'static str,
        attempts: u32,
        detail: String,
    },

    /// Settlement could not be recorded; the job stays `in_progress`.
    SettlementFailed { job_id: String, detail: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidTransition { job_id, from, attempted } => write!(
                f,
                "cannot {} job {}: status is {}",
                attempted,
                job_id,
                from.as_str()
            ),
            EngineError::AlreadyClaimed { job_id } => {
                write!(f, "job {} was already claimed by another fulfiller", job_id)
            }
            EngineError::Unauthorized { job_id, actor } => {
                write!(f, "party {} is not authorized to act on job {}", actor, job_id)
            }
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
            EngineError::NotFound(job_id) => write!(f, "job not found: {}", job_id),
            EngineError::CollaboratorUnavailable { collaborator, attempts, detail } => write!(
                f,
                "{} unavailable after {} attempts: {}",
                collaborator, attempts, detail
            ),
            EngineError::SettlementFailed { job_id, detail } => {
                write!(f, "settlement failed for job {}: {}", job_id, detail)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<payout::InvalidInput> for EngineError {
    fn from(err: payout::InvalidInput) -> Self {
        EngineError::InvalidInput(err.0)
    }
}

impl ResponseError for EngineError {
    fn error_response(&self) -> HttpResponse {
        match self {
            EngineError::InvalidTransition { .. } => {
                warn!("{}", self);
                HttpResponse::Conflict().json(ErrorResponse {
                    error: "Invalid transition".to_string(),
                    fields: serde_json::json!({"message": self.to_string()}),
                })
            }
            EngineError::AlreadyClaimed { .. } => {
                warn!("{}", self);
                HttpResponse::Conflict().json(ErrorResponse {
                    error: "Offer no longer available".to_string(),
                    fields: serde_json::json!({"message": self.to_string()}),
                })
            }
            EngineError::Unauthorized { .. } => {
                warn!("{}", self);
                HttpResponse::Forbidden().json(ErrorResponse {
                    error: "Not authorized".to_string(),
                    fields: serde_json::json!({"message": self.to_string()}),
                })
            }
            EngineError::InvalidInput(_) => {
                warn!("{}", self);
                HttpResponse::BadRequest().json(ErrorResponse {
                    error: "Invalid input".to_string(),
                    fields: serde_json::json!({"message": self.to_string()}),
                })
            }
            EngineError::NotFound(_) => {
                warn!("{}", self);
                HttpResponse::NotFound().json(ErrorResponse {
                    error: "Not found".to_string(),
                    fields: serde_json::json!({"message": self.to_string()}),
                })
            }
            EngineError::CollaboratorUnavailable { .. } => {
                error!("{}", self);
                HttpResponse::ServiceUnavailable().json(ErrorResponse {
                    error: "Temporarily unavailable".to_string(),
                    fields: serde_json::json!({"message": "Please retry shortly"}),
                })
            }
            EngineError::SettlementFailed { .. } => {
                error!("{}", self);
                HttpResponse::BadGateway().json(ErrorResponse {
                    error: "Settlement failed".to_string(),
                    fields: serde_json::json!({"message": self.to_string()}),
                })
            }
        }
    }
}
