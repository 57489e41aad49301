use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::collaborators::geo::GeoPoint;

/// Milestone events pushed to the parties of a job. Delivery is best
/// effort: a lost notification never affects the underlying transition.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotifyEvent {
    OfferAccepted {
        job_id: String,
        fulfiller_id: String,
    },
    TravelStarted {
        job_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        position: Option<GeoPoint>,
    },
    DelayReported {
        job_id: String,
        minutes: i64,
    },
    WorkStarted {
        job_id: String,
    },
    JobCompleted {
        job_id: String,
        net_payout_minor: i64,
    },
    JobCancelled {
        job_id: String,
        cancelled_by: String,
        reason: String,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Best effort. Implementations may fail; callers must not care.
    async fn notify(&self, party_id: &str, event: NotifyEvent) -> Result<(), String>;
}

/// Default notifier: structured log lines. A push/SMS gateway slots in
/// behind the same trait in deployment.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, party_id: &str, event: NotifyEvent) -> Result<(), String> {
        let payload = serde_json::to_string(&event).map_err(|e| e.to_string())?;
        info!(party_id, payload, "notification dispatched");
        Ok(())
    }
}
