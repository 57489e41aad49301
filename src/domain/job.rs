use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a booking across its lifecycle.
///
/// `Declined`, `Cancelled` and `Completed` are terminal: no transition
/// leaves them. Everything else moves strictly forward.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Accepted,
    OnTheWay,
    InProgress,
    Completed,
    Declined,
    Cancelled,
}

impl JobStatus {
    /// Stable wire/storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Accepted => "accepted",
            JobStatus::OnTheWay => "on_the_way",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Declined => "declined",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "accepted" => Some(JobStatus::Accepted),
            "on_the_way" => Some(JobStatus::OnTheWay),
            "in_progress" => Some(JobStatus::InProgress),
            "completed" => Some(JobStatus::Completed),
            "declined" => Some(JobStatus::Declined),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Declined | JobStatus::Cancelled
        )
    }

    /// The full transition table. `Pending -> Declined` exists so external
    /// dispatch can retire an exhausted offer through the same conditional
    /// write; the engine's `decline` itself only audits.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (*self, next),
            (Pending, Accepted)
                | (Pending, Declined)
                | (Pending, Cancelled)
                | (Accepted, OnTheWay)
                | (Accepted, InProgress)
                | (Accepted, Cancelled)
                | (OnTheWay, InProgress)
                | (OnTheWay, Cancelled)
                | (InProgress, Completed)
        )
    }

    /// States from which `cancel` is allowed. Once work is physically
    /// underway the cancel path is a dispute, not a transition.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Accepted | JobStatus::OnTheWay
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

/// One scheduled service engagement between a requester and a fulfiller.
///
/// `accepted_at` is set iff the status has passed `accepted`;
/// `completed_at` iff the status is `completed`. The row in storage is the
/// single source of truth; this struct is a snapshot of it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub requester_id: String,
    pub fulfiller_id: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i64,
    /// Gross price in currency minor units.
    pub gross_price_minor: i64,
    /// Platform fee rate in basis points (2000 = 20%).
    pub fee_rate_bp: i64,
    pub add_ons: Vec<String>,
    pub location: Location,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

impl Job {
    pub fn is_assigned_to(&self, party: &str) -> bool {
        self.fulfiller_id.as_deref() == Some(party)
    }

    /// Cancellation is open to the owning requester or the assigned
    /// fulfiller, nobody else.
    pub fn may_cancel(&self, party: &str) -> bool {
        self.requester_id == party || self.is_assigned_to(party)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_storage_form() {
        for status in [
            JobStatus::Pending,
            JobStatus::Accepted,
            JobStatus::OnTheWay,
            JobStatus::InProgress,
            JobStatus::Completed,
            JobStatus::Declined,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("paused"), None);
    }

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        use JobStatus::*;
        let all = [Pending, Accepted, OnTheWay, InProgress, Completed, Declined, Cancelled];
        for terminal in [Completed, Declined, Cancelled] {
            for next in all {
                assert!(
                    !terminal.can_transition_to(next),
                    "{:?} must not move to {:?}",
                    terminal,
                    next
                );
            }
        }
    }

    #[test]
    fn happy_path_is_monotonic() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Accepted));
        assert!(Accepted.can_transition_to(OnTheWay));
        assert!(OnTheWay.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        // No going back.
        assert!(!Accepted.can_transition_to(Pending));
        assert!(!InProgress.can_transition_to(OnTheWay));
    }

    #[test]
    fn begin_work_may_skip_travel() {
        assert!(JobStatus::Accepted.can_transition_to(JobStatus::InProgress));
    }

    #[test]
    fn cancel_window_closes_once_work_starts() {
        use JobStatus::*;
        assert!(Pending.is_cancellable());
        assert!(Accepted.is_cancellable());
        assert!(OnTheWay.is_cancellable());
        assert!(!InProgress.is_cancellable());
        assert!(!Completed.is_cancellable());
        assert!(!InProgress.can_transition_to(Cancelled));
    }

    #[test]
    fn decline_only_from_pending() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Declined));
        for from in [Accepted, OnTheWay, InProgress] {
            assert!(!from.can_transition_to(Declined));
        }
    }
}
