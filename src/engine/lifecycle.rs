use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::collaborators::geo::GeoLocator;
use crate::collaborators::notify::{Notifier, NotifyEvent};
use crate::collaborators::settlement::SettlementLedger;
use crate::collaborators::storage::{JobAuditEntry, JobStore, StatusFields, StoreError};
use crate::domain::{Job, JobStatus, Location};
use crate::engine::error::EngineError;
use crate::engine::retry::{RetryFailure, RetryPolicy};
use crate::mirror::LocalMirror;
use crate::payout::{self, PayoutBreakdown};

/// Input for a new booking, as handed over by the requester flow.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub requester_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub gross_price_minor: i64,
    pub fee_rate_bp: i64,
    pub add_ons: Vec<String>,
    pub location: Location,
}

/// The job lifecycle engine: guarded transitions over the storage
/// collaborator's conditional writes.
///
/// Every transition follows the same shape: read the job, authorize the
/// acting party, overlay the expected outcome on the local mirror, perform
/// one compare-status-and-swap write, then confirm or roll the overlay
/// back. Notifications ride behind the transition and never affect it.
pub struct LifecycleEngine {
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn SettlementLedger>,
    notifier: Arc<dyn Notifier>,
    geo: Arc<dyn GeoLocator>,
    mirror: Arc<LocalMirror>,
    retry: RetryPolicy,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn SettlementLedger>,
        notifier: Arc<dyn Notifier>,
        geo: Arc<dyn GeoLocator>,
        mirror: Arc<LocalMirror>,
        retry: RetryPolicy,
    ) -> Self {
        LifecycleEngine {
            store,
            ledger,
            notifier,
            geo,
            mirror,
            retry,
        }
    }

    pub fn mirror(&self) -> &LocalMirror {
        &self.mirror
    }

    /// Insert a new booking in `pending`. The payout contract is checked up
    /// front so a job that cannot settle is never offered.
    pub async fn create_job(&self, new_job: NewJob) -> Result<Job, EngineError> {
        payout::compute_payout(
            new_job.gross_price_minor,
            new_job.duration_minutes,
            new_job.fee_rate_bp,
        )?;

        let job = Job {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            requester_id: new_job.requester_id,
            fulfiller_id: None,
            scheduled_at: new_job.scheduled_at,
            duration_minutes: new_job.duration_minutes,
            gross_price_minor: new_job.gross_price_minor,
            fee_rate_bp: new_job.fee_rate_bp,
            add_ons: new_job.add_ons,
            location: new_job.location,
            created_at: Utc::now(),
            accepted_at: None,
            completed_at: None,
            cancel_reason: None,
        };

        let stored = self
            .retry
            .run("storage.insert_job", || self.store.insert_job(&job))
            .await
            .map_err(|failure| Self::storage_failure(&job.id, failure))?;
        self.mirror.confirm(stored.clone());
        info!(job_id = %stored.id, requester_id = %stored.requester_id, "job created");
        Ok(stored)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job, EngineError> {
        self.load(job_id).await
    }

    /// Claim a pending offer. Exactly one of any number of concurrent
    /// acceptors wins; the rest learn the offer is gone.
    pub async fn accept(&self, job_id: &str, fulfiller_id: &str) -> Result<Job, EngineError> {
        let job = self.load(job_id).await?;
        let now = Utc::now();

        let mut projected = job.clone();
        projected.status = JobStatus::Accepted;
        projected.fulfiller_id = Some(fulfiller_id.to_string());
        projected.accepted_at = Some(now);
        self.mirror.apply_optimistic(projected);

        let fields = StatusFields {
            fulfiller_id: Some(fulfiller_id.to_string()),
            accepted_at: Some(now),
            ..Default::default()
        };
        match self
            .swap_status(job_id, JobStatus::Pending, JobStatus::Accepted, fields)
            .await
        {
            Ok(updated) => {
                self.mirror.confirm(updated.clone());
                info!(job_id, fulfiller_id, "offer accepted");
                self.fire_notify(
                    updated.requester_id.clone(),
                    NotifyEvent::OfferAccepted {
                        job_id: job_id.to_string(),
                        fulfiller_id: fulfiller_id.to_string(),
                    },
                );
                Ok(updated)
            }
            Err(StoreError::Conflict { actual }) => {
                self.mirror.rollback(job_id);
                self.refresh_mirror(job_id).await;
                match actual {
                    JobStatus::Accepted
                    | JobStatus::OnTheWay
                    | JobStatus::InProgress
                    | JobStatus::Completed => {
                        Err(EngineError::AlreadyClaimed {
                            job_id: job_id.to_string(),
                        })
                    }
                    _ => Err(EngineError::InvalidTransition {
                        job_id: job_id.to_string(),
                        from: actual,
                        attempted: "accept",
                    }),
                }
            }
            Err(err) => {
                self.mirror.rollback(job_id);
                Err(self.map_swap_error(job_id, err))
            }
        }
    }

    /// Turn down a pending offer. The shared row is untouched beyond an
    /// audit entry; re-offering is external dispatch's concern.
    pub async fn decline(&self, job_id: &str, fulfiller_id: &str) -> Result<(), EngineError> {
        let job = self.load(job_id).await?;
        if job.status != JobStatus::Pending {
            return Err(EngineError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                attempted: "decline",
            });
        }

        let entry = JobAuditEntry {
            job_id: job_id.to_string(),
            actor: fulfiller_id.to_string(),
            action: "decline".to_string(),
            expected_status: Some(JobStatus::Pending),
            actual_status: Some(job.status),
            detail: "offer declined, returned to pool".to_string(),
        };
        self.retry
            .run("storage.record_audit", || self.store.record_audit(entry.clone()))
            .await
            .map_err(|failure| Self::storage_failure(job_id, failure))?;
        info!(job_id, fulfiller_id, "offer declined");
        Ok(())
    }

    /// Provider is en route. Notifies the requester at most once, enriched
    /// with coordinates when the geolocation collaborator answers in time.
    pub async fn start_travel(&self, job_id: &str, fulfiller_id: &str) -> Result<Job, EngineError> {
        let job = self.load(job_id).await?;
        self.authorize_fulfiller(&job, fulfiller_id, "start_travel")?;

        let updated = self
            .swap_from(
                &job,
                &[JobStatus::Accepted],
                JobStatus::OnTheWay,
                StatusFields::default(),
                "start_travel",
            )
            .await?;

        let position = match timeout(self.retry.call_timeout, self.geo.locate(fulfiller_id)).await {
            Ok(position) => position,
            Err(_) => None,
        };
        self.fire_notify(
            updated.requester_id.clone(),
            NotifyEvent::TravelStarted {
                job_id: job_id.to_string(),
                position,
            },
        );
        Ok(updated)
    }

    /// Side-channel heads-up that the provider is running late. No status
    /// change; purely informs the requester.
    pub async fn report_delay(
        &self,
        job_id: &str,
        fulfiller_id: &str,
        minutes: i64,
    ) -> Result<(), EngineError> {
        let job = self.load(job_id).await?;
        self.authorize_fulfiller(&job, fulfiller_id, "report_delay")?;
        if !matches!(job.status, JobStatus::Accepted | JobStatus::OnTheWay) {
            return Err(EngineError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                attempted: "report_delay",
            });
        }
        self.fire_notify(
            job.requester_id.clone(),
            NotifyEvent::DelayReported {
                job_id: job_id.to_string(),
                minutes,
            },
        );
        info!(job_id, fulfiller_id, minutes, "delay reported");
        Ok(())
    }

    /// Work begins on site. Some flows skip the travel sub-state, so both
    /// `accepted` and `on_the_way` are valid sources.
    pub async fn begin_work(&self, job_id: &str, fulfiller_id: &str) -> Result<Job, EngineError> {
        let job = self.load(job_id).await?;
        self.authorize_fulfiller(&job, fulfiller_id, "begin_work")?;

        let updated = self
            .swap_from(
                &job,
                &[JobStatus::Accepted, JobStatus::OnTheWay],
                JobStatus::InProgress,
                StatusFields::default(),
                "begin_work",
            )
            .await?;
        self.fire_notify(
            updated.requester_id.clone(),
            NotifyEvent::WorkStarted {
                job_id: job_id.to_string(),
            },
        );
        Ok(updated)
    }

    /// Finish the job. The payout breakdown becomes the authoritative
    /// settlement record *before* the status flips: a completed job without
    /// a settlement would be an invariant violation, so settlement failure
    /// leaves the job `in_progress` (parked on the retry queue when the
    /// backend was merely unreachable).
    pub async fn complete(
        &self,
        job_id: &str,
        fulfiller_id: &str,
    ) -> Result<(Job, PayoutBreakdown), EngineError> {
        let job = self.load(job_id).await?;
        self.authorize_fulfiller(&job, fulfiller_id, "complete")?;
        if job.status != JobStatus::InProgress {
            return Err(EngineError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                attempted: "complete",
            });
        }

        let breakdown =
            payout::compute_payout(job.gross_price_minor, job.duration_minutes, job.fee_rate_bp)?;

        match self
            .retry
            .run("payment.record_settlement", || {
                self.ledger.record_settlement(job_id, &breakdown)
            })
            .await
        {
            Ok(()) => {}
            Err(RetryFailure::Fatal(err)) => {
                let detail = err.to_string();
                self.audit_money_failure(&job, "complete", &detail).await;
                return Err(EngineError::SettlementFailed {
                    job_id: job_id.to_string(),
                    detail,
                });
            }
            Err(RetryFailure::Exhausted { attempts, last, .. }) => {
                let deferred =
                    timeout(self.retry.call_timeout, self.ledger.defer(job_id, &last)).await;
                let detail = match deferred {
                    Ok(Ok(())) => format!(
                        "settlement backend unreachable after {} attempts ({}); deferred to retry queue",
                        attempts, last
                    ),
                    _ => format!(
                        "settlement backend unreachable after {} attempts ({}); defer also failed",
                        attempts, last
                    ),
                };
                self.audit_money_failure(&job, "complete", &detail).await;
                return Err(EngineError::SettlementFailed {
                    job_id: job_id.to_string(),
                    detail,
                });
            }
        }

        let now = Utc::now();
        let fields = StatusFields {
            completed_at: Some(now),
            ..Default::default()
        };
        let mut projected = job.clone();
        projected.status = JobStatus::Completed;
        projected.completed_at = Some(now);
        self.mirror.apply_optimistic(projected);

        match self
            .swap_status(job_id, JobStatus::InProgress, JobStatus::Completed, fields)
            .await
        {
            Ok(updated) => {
                self.mirror.confirm(updated.clone());
                info!(
                    job_id,
                    fulfiller_id,
                    net_payout_minor = breakdown.net_payout_minor,
                    "job completed and settled"
                );
                self.fire_notify(
                    updated.requester_id.clone(),
                    NotifyEvent::JobCompleted {
                        job_id: job_id.to_string(),
                        net_payout_minor: breakdown.net_payout_minor,
                    },
                );
                self.fire_notify(
                    fulfiller_id.to_string(),
                    NotifyEvent::JobCompleted {
                        job_id: job_id.to_string(),
                        net_payout_minor: breakdown.net_payout_minor,
                    },
                );
                Ok((updated, breakdown))
            }
            Err(StoreError::Conflict { actual }) => {
                // Another session finished (or the job got cancelled) in
                // between; the keyed settlement insert stays single.
                self.mirror.rollback(job_id);
                self.refresh_mirror(job_id).await;
                Err(EngineError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: actual,
                    attempted: "complete",
                })
            }
            Err(err) => {
                self.mirror.rollback(job_id);
                Err(self.map_swap_error(job_id, err))
            }
        }
    }

    /// Call off a job that is not yet physically underway. Later states
    /// require the dispute path, not a cancel.
    pub async fn cancel(
        &self,
        job_id: &str,
        acting_party: &str,
        reason: &str,
    ) -> Result<Job, EngineError> {
        let job = self.load(job_id).await?;
        if !job.may_cancel(acting_party) {
            warn!(job_id, acting_party, "cancel attempt by unrelated party");
            return Err(EngineError::Unauthorized {
                job_id: job_id.to_string(),
                actor: acting_party.to_string(),
            });
        }
        if !job.status.is_cancellable() {
            return Err(EngineError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                attempted: "cancel",
            });
        }

        let fields = StatusFields {
            cancel_reason: Some(reason.to_string()),
            ..Default::default()
        };
        let updated = self
            .swap_from(
                &job,
                &[JobStatus::Pending, JobStatus::Accepted, JobStatus::OnTheWay],
                JobStatus::Cancelled,
                fields,
                "cancel",
            )
            .await?;

        let counterparty = if acting_party == updated.requester_id {
            updated.fulfiller_id.clone()
        } else {
            Some(updated.requester_id.clone())
        };
        if let Some(party) = counterparty {
            self.fire_notify(
                party,
                NotifyEvent::JobCancelled {
                    job_id: job_id.to_string(),
                    cancelled_by: acting_party.to_string(),
                    reason: reason.to_string(),
                },
            );
        }
        info!(job_id, acting_party, reason, "job cancelled");
        Ok(updated)
    }

    async fn load(&self, job_id: &str) -> Result<Job, EngineError> {
        let job = self
            .retry
            .run("storage.get_job", || self.store.get_job(job_id))
            .await
            .map_err(|failure| Self::storage_failure(job_id, failure))?;
        self.mirror.reconcile(job.clone());
        Ok(job)
    }

    /// One conditional status write, with the timeout rule from the
    /// concurrency model: after a timeout (or an ambiguous backend error)
    /// the write may or may not have landed, so actual state is re-read
    /// before the next attempt instead of blindly re-issuing the swap.
    async fn swap_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        new: JobStatus,
        fields: StatusFields,
    ) -> Result<Job, StoreError> {
        let attempts = self.retry.max_attempts.max(1);
        let mut last = String::from("conditional write never attempted");
        for attempt in 1..=attempts {
            let write = self
                .store
                .conditional_update_status(job_id, expected, new, fields.clone());
            match timeout(self.retry.call_timeout, write).await {
                Ok(Ok(job)) => return Ok(job),
                Ok(Err(StoreError::Unavailable(msg))) => {
                    warn!(job_id, attempt, error = %msg, "conditional write failed");
                    last = msg;
                }
                Ok(Err(other)) => return Err(other),
                Err(_) => {
                    warn!(job_id, attempt, "conditional write timed out");
                    last = format!("timed out after {:?}", self.retry.call_timeout);
                }
            }

            if let Ok(Ok(job)) = timeout(self.retry.call_timeout, self.store.get_job(job_id)).await
            {
                if job.status == new {
                    // Our write may have landed before the failure surfaced.
                    // For the accept race the fulfiller identity decides
                    // whether it was ours or a rival's.
                    let ours = match &fields.fulfiller_id {
                        Some(fulfiller) => job.fulfiller_id.as_deref() == Some(fulfiller.as_str()),
                        None => true,
                    };
                    if ours {
                        return Ok(job);
                    }
                    return Err(StoreError::Conflict { actual: job.status });
                }
                if job.status != expected {
                    return Err(StoreError::Conflict { actual: job.status });
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry.backoff_delay(attempt)).await;
            }
        }
        Err(StoreError::Unavailable(last))
    }

    /// Conditional swap from any of several valid source states. When a
    /// rival session advanced the job within the allowed set (travel
    /// started on another device, say), the swap is re-tried against the
    /// fresh status instead of failing.
    async fn swap_from(
        &self,
        job: &Job,
        sources: &[JobStatus],
        new: JobStatus,
        fields: StatusFields,
        attempted: &'static str,
    ) -> Result<Job, EngineError> {
        let job_id = job.id.as_str();
        let mut expected = job.status;
        if !sources.contains(&expected) || !expected.can_transition_to(new) {
            return Err(EngineError::InvalidTransition {
                job_id: job_id.to_string(),
                from: expected,
                attempted,
            });
        }

        let mut projected = job.clone();
        projected.status = new;
        if let Some(reason) = &fields.cancel_reason {
            projected.cancel_reason = Some(reason.clone());
        }
        self.mirror.apply_optimistic(projected);

        for _ in 0..self.retry.max_attempts.max(1) {
            match self
                .swap_status(job_id, expected, new, fields.clone())
                .await
            {
                Ok(updated) => {
                    self.mirror.confirm(updated.clone());
                    info!(job_id, from = expected.as_str(), to = new.as_str(), "status advanced");
                    return Ok(updated);
                }
                Err(StoreError::Conflict { actual }) if sources.contains(&actual) => {
                    expected = actual;
                }
                Err(StoreError::Conflict { actual }) => {
                    self.mirror.rollback(job_id);
                    self.refresh_mirror(job_id).await;
                    return Err(EngineError::InvalidTransition {
                        job_id: job_id.to_string(),
                        from: actual,
                        attempted,
                    });
                }
                Err(err) => {
                    self.mirror.rollback(job_id);
                    return Err(self.map_swap_error(job_id, err));
                }
            }
        }

        self.mirror.rollback(job_id);
        Err(EngineError::CollaboratorUnavailable {
            collaborator: "storage",
            attempts: self.retry.max_attempts,
            detail: "conditional write kept losing races".to_string(),
        })
    }

    fn authorize_fulfiller(
        &self,
        job: &Job,
        party: &str,
        attempted: &'static str,
    ) -> Result<(), EngineError> {
        if job.is_assigned_to(party) {
            return Ok(());
        }
        warn!(job_id = %job.id, party, attempted, "lifecycle call by unassigned party");
        Err(EngineError::Unauthorized {
            job_id: job.id.clone(),
            actor: party.to_string(),
        })
    }

    fn map_swap_error(&self, job_id: &str, err: StoreError) -> EngineError {
        match err {
            StoreError::NotFound => EngineError::NotFound(job_id.to_string()),
            StoreError::Conflict { actual } => EngineError::InvalidTransition {
                job_id: job_id.to_string(),
                from: actual,
                attempted: "update",
            },
            StoreError::Unavailable(detail) | StoreError::Refused(detail) => {
                EngineError::CollaboratorUnavailable {
                    collaborator: "storage",
                    attempts: self.retry.max_attempts,
                    detail,
                }
            }
        }
    }

    fn storage_failure(job_id: &str, failure: RetryFailure<StoreError>) -> EngineError {
        match failure {
            RetryFailure::Fatal(StoreError::NotFound) => EngineError::NotFound(job_id.to_string()),
            RetryFailure::Fatal(err) => EngineError::CollaboratorUnavailable {
                collaborator: "storage",
                attempts: 1,
                detail: err.to_string(),
            },
            RetryFailure::Exhausted { attempts, last, .. } => EngineError::CollaboratorUnavailable {
                collaborator: "storage",
                attempts,
                detail: last,
            },
        }
    }

    async fn refresh_mirror(&self, job_id: &str) {
        if let Ok(Ok(job)) = timeout(self.retry.call_timeout, self.store.get_job(job_id)).await {
            self.mirror.reconcile(job);
        }
    }

    /// Money-affecting failures carry enough context for manual
    /// reconciliation: job, attempted transition, expected vs actual.
    async fn audit_money_failure(&self, job: &Job, attempted: &'static str, detail: &str) {
        error!(
            job_id = %job.id,
            attempted,
            expected = JobStatus::InProgress.as_str(),
            actual = job.status.as_str(),
            detail,
            "money-affecting operation failed"
        );
        let entry = JobAuditEntry {
            job_id: job.id.clone(),
            actor: job.fulfiller_id.clone().unwrap_or_default(),
            action: format!("{}_failed", attempted),
            expected_status: Some(JobStatus::InProgress),
            actual_status: Some(job.status),
            detail: detail.to_string(),
        };
        if let Ok(Err(err)) = timeout(self.retry.call_timeout, self.store.record_audit(entry)).await
        {
            warn!(job_id = %job.id, error = %err, "audit write failed");
        }
    }

    /// Fire-and-forget, bounded. Delivery failure is logged and dropped;
    /// it never rolls back or delays the transition it rode on.
    fn fire_notify(&self, party_id: String, event: NotifyEvent) {
        let notifier = Arc::clone(&self.notifier);
        let ttl = self.retry.call_timeout;
        tokio::spawn(async move {
            match timeout(ttl, notifier.notify(&party_id, event)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(party_id = %party_id, error = %err, "notification delivery failed"),
                Err(_) => warn!(party_id = %party_id, "notification delivery timed out"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::collaborators::geo::{GeoPoint, NoopGeoLocator};
    use crate::collaborators::memory::{
        FixedGeoLocator, MemoryJobStore, MemoryLedger, RecordingNotifier,
    };

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            call_timeout: Duration::from_millis(250),
        }
    }

    fn pending_job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            status: JobStatus::Pending,
            requester_id: "req-1".to_string(),
            fulfiller_id: None,
            scheduled_at: Utc::now(),
            duration_minutes: 90,
            gross_price_minor: 10_000,
            fee_rate_bp: 2_000,
            add_ons: vec!["deep_clean".to_string()],
            location: Location {
                address: "4 Bay Rd".to_string(),
                latitude: None,
                longitude: None,
            },
            created_at: Utc::now(),
            accepted_at: None,
            completed_at: None,
            cancel_reason: None,
        }
    }

    struct Harness {
        engine: Arc<LifecycleEngine>,
        store: Arc<MemoryJobStore>,
        ledger: Arc<MemoryLedger>,
        notifier: Arc<RecordingNotifier>,
        mirror: Arc<LocalMirror>,
    }

    fn harness_with(job: Job) -> Harness {
        let store = Arc::new(MemoryJobStore::with_job(job));
        let ledger = Arc::new(MemoryLedger::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let mirror = Arc::new(LocalMirror::new());
        let engine = Arc::new(LifecycleEngine::new(
            store.clone(),
            ledger.clone(),
            notifier.clone(),
            Arc::new(NoopGeoLocator),
            mirror.clone(),
            quick_retry(),
        ));
        Harness {
            engine,
            store,
            ledger,
            notifier,
            mirror,
        }
    }

    /// Let spawned notification tasks drain.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    #[tokio::test]
    async fn accept_assigns_the_fulfiller() {
        let h = harness_with(pending_job("job-1"));
        let job = h.engine.accept("job-1", "ful-a").await.unwrap();
        assert_eq!(job.status, JobStatus::Accepted);
        assert_eq!(job.fulfiller_id.as_deref(), Some("ful-a"));
        assert!(job.accepted_at.is_some());

        settle().await;
        let events = h.notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "req-1");
        assert!(matches!(events[0].1, NotifyEvent::OfferAccepted { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_accepts_have_exactly_one_winner() {
        let h = harness_with(pending_job("job-1"));
        let (a, b) = tokio::join!(
            {
                let engine = h.engine.clone();
                tokio::spawn(async move { engine.accept("job-1", "ful-a").await })
            },
            {
                let engine = h.engine.clone();
                tokio::spawn(async move { engine.accept("job-1", "ful-b").await })
            }
        );
        let results = [a.unwrap(), b.unwrap()];
        let winners: Vec<&Job> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        let loser = results
            .iter()
            .find_map(|r| r.as_ref().err())
            .expect("one acceptor must lose");
        assert!(matches!(loser, EngineError::AlreadyClaimed { .. }));

        let stored = h.store.get_job("job-1").await.unwrap();
        assert_eq!(stored.fulfiller_id, winners[0].fulfiller_id);
        // The loser's mirror view was reconciled back to the winner's state.
        let view = h.mirror.get("job-1").unwrap();
        assert_eq!(view.status, JobStatus::Accepted);
        assert_eq!(view.fulfiller_id, stored.fulfiller_id);
    }

    #[tokio::test]
    async fn accept_after_cancel_reports_invalid_transition() {
        let h = harness_with(pending_job("job-1"));
        h.engine.cancel("job-1", "req-1", "changed plans").await.unwrap();
        let err = h.engine.accept("job-1", "ful-a").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn decline_leaves_the_row_pending_and_audits() {
        let h = harness_with(pending_job("job-1"));
        h.engine.decline("job-1", "ful-a").await.unwrap();

        let stored = h.store.get_job("job-1").await.unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.fulfiller_id, None);

        let audits = h.store.audit_entries();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].action, "decline");
        assert_eq!(audits[0].actor, "ful-a");
    }

    #[tokio::test]
    async fn start_travel_carries_position_when_available() {
        let store = Arc::new(MemoryJobStore::with_job(pending_job("job-1")));
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = LifecycleEngine::new(
            store.clone(),
            Arc::new(MemoryLedger::new()),
            notifier.clone(),
            Arc::new(FixedGeoLocator(GeoPoint {
                latitude: 51.5,
                longitude: -0.12,
            })),
            Arc::new(LocalMirror::new()),
            quick_retry(),
        );

        engine.accept("job-1", "ful-a").await.unwrap();
        let job = engine.start_travel("job-1", "ful-a").await.unwrap();
        assert_eq!(job.status, JobStatus::OnTheWay);

        settle().await;
        let travel = notifier
            .events()
            .into_iter()
            .find(|(_, e)| matches!(e, NotifyEvent::TravelStarted { .. }))
            .expect("travel notification");
        match travel.1 {
            NotifyEvent::TravelStarted { position, .. } => {
                assert!(position.is_some());
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn notification_failure_never_rolls_back_the_transition() {
        let h = harness_with(pending_job("job-1"));
        h.notifier.fail.store(true, Ordering::SeqCst);

        h.engine.accept("job-1", "ful-a").await.unwrap();
        let job = h.engine.start_travel("job-1", "ful-a").await.unwrap();
        assert_eq!(job.status, JobStatus::OnTheWay);

        settle().await;
        let stored = h.store.get_job("job-1").await.unwrap();
        assert_eq!(stored.status, JobStatus::OnTheWay);
        assert!(h.notifier.events().is_empty());
    }

    #[tokio::test]
    async fn begin_work_is_valid_from_accepted_or_on_the_way() {
        let h = harness_with(pending_job("job-1"));
        h.engine.accept("job-1", "ful-a").await.unwrap();
        // Flow that skips the travel sub-state.
        let job = h.engine.begin_work("job-1", "ful-a").await.unwrap();
        assert_eq!(job.status, JobStatus::InProgress);

        let h2 = harness_with(pending_job("job-2"));
        h2.engine.accept("job-2", "ful-a").await.unwrap();
        h2.engine.start_travel("job-2", "ful-a").await.unwrap();
        let job2 = h2.engine.begin_work("job-2", "ful-a").await.unwrap();
        assert_eq!(job2.status, JobStatus::InProgress);
    }

    #[tokio::test]
    async fn unassigned_party_cannot_drive_the_job() {
        let h = harness_with(pending_job("job-1"));
        h.engine.accept("job-1", "ful-a").await.unwrap();
        for result in [
            h.engine.start_travel("job-1", "ful-b").await.err(),
            h.engine.begin_work("job-1", "ful-b").await.err(),
            h.engine.complete("job-1", "ful-b").await.err(),
            h.engine.report_delay("job-1", "ful-b", 15).await.err(),
        ] {
            assert!(matches!(result, Some(EngineError::Unauthorized { .. })));
        }
    }

    #[tokio::test]
    async fn complete_records_settlement_before_flipping_status() {
        let h = harness_with(pending_job("job-1"));
        h.engine.accept("job-1", "ful-a").await.unwrap();
        h.engine.begin_work("job-1", "ful-a").await.unwrap();
        let (job, breakdown) = h.engine.complete("job-1", "ful-a").await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert_eq!(breakdown.net_payout_minor, 8_000);
        assert_eq!(breakdown.platform_fee_minor, 2_000);

        let recorded = h.ledger.settlement_for("job-1").expect("settlement record");
        assert_eq!(recorded.net_payout_minor + recorded.platform_fee_minor, 10_000);
    }

    #[tokio::test]
    async fn complete_twice_is_a_noop_with_a_single_settlement() {
        let h = harness_with(pending_job("job-1"));
        h.engine.accept("job-1", "ful-a").await.unwrap();
        h.engine.begin_work("job-1", "ful-a").await.unwrap();
        h.engine.complete("job-1", "ful-a").await.unwrap();

        let err = h.engine.complete("job-1", "ful-a").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(h.ledger.settlement_count(), 1);
        assert_eq!(
            h.store.get_job("job-1").await.unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn settlement_rejection_keeps_the_job_in_progress() {
        let h = harness_with(pending_job("job-1"));
        h.engine.accept("job-1", "ful-a").await.unwrap();
        h.engine.begin_work("job-1", "ful-a").await.unwrap();
        h.ledger.reject_records.store(true, Ordering::SeqCst);

        let err = h.engine.complete("job-1", "ful-a").await.unwrap_err();
        assert!(matches!(err, EngineError::SettlementFailed { .. }));
        assert_eq!(
            h.store.get_job("job-1").await.unwrap().status,
            JobStatus::InProgress
        );
        assert_eq!(h.ledger.settlement_count(), 0);
        // Reconciliation context made it to the audit trail.
        assert!(h
            .store
            .audit_entries()
            .iter()
            .any(|e| e.action == "complete_failed"));
    }

    #[tokio::test]
    async fn settlement_outage_defers_to_the_retry_queue() {
        let h = harness_with(pending_job("job-1"));
        h.engine.accept("job-1", "ful-a").await.unwrap();
        h.engine.begin_work("job-1", "ful-a").await.unwrap();
        h.ledger.unavailable.store(true, Ordering::SeqCst);

        let err = h.engine.complete("job-1", "ful-a").await.unwrap_err();
        assert!(matches!(err, EngineError::SettlementFailed { .. }));
        assert_eq!(h.ledger.deferred_count(), 1);
        assert_eq!(
            h.store.get_job("job-1").await.unwrap().status,
            JobStatus::InProgress
        );
    }

    #[tokio::test]
    async fn cancel_is_refused_once_work_is_underway() {
        let h = harness_with(pending_job("job-1"));
        h.engine.accept("job-1", "ful-a").await.unwrap();
        h.engine.begin_work("job-1", "ful-a").await.unwrap();

        let err = h.engine.cancel("job-1", "req-1", "too late").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        let stored = h.store.get_job("job-1").await.unwrap();
        assert_eq!(stored.status, JobStatus::InProgress);
        assert_eq!(stored.cancel_reason, None);

        h.engine.complete("job-1", "ful-a").await.unwrap();
        let err = h.engine.cancel("job-1", "req-1", "still no").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn cancel_notifies_the_counterparty_and_records_the_reason() {
        let h = harness_with(pending_job("job-1"));
        h.engine.accept("job-1", "ful-a").await.unwrap();
        let job = h.engine.cancel("job-1", "req-1", "double booked").await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.cancel_reason.as_deref(), Some("double booked"));

        settle().await;
        assert!(h
            .notifier
            .events()
            .iter()
            .any(|(party, e)| party == "ful-a" && matches!(e, NotifyEvent::JobCancelled { .. })));
    }

    #[tokio::test]
    async fn cancel_by_a_stranger_is_unauthorized() {
        let h = harness_with(pending_job("job-1"));
        let err = h.engine.cancel("job-1", "someone-else", "nope").await.unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn report_delay_changes_nothing_but_informs() {
        let h = harness_with(pending_job("job-1"));
        h.engine.accept("job-1", "ful-a").await.unwrap();
        h.engine.report_delay("job-1", "ful-a", 20).await.unwrap();

        let stored = h.store.get_job("job-1").await.unwrap();
        assert_eq!(stored.status, JobStatus::Accepted);

        settle().await;
        assert!(h
            .notifier
            .events()
            .iter()
            .any(|(party, e)| party == "req-1"
                && matches!(e, NotifyEvent::DelayReported { minutes: 20, .. })));
    }

    #[tokio::test]
    async fn report_delay_requires_an_active_assignment() {
        let h = harness_with(pending_job("job-1"));
        h.engine.accept("job-1", "ful-a").await.unwrap();
        h.engine.begin_work("job-1", "ful-a").await.unwrap();
        let err = h.engine.report_delay("job-1", "ful-a", 10).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn create_job_rejects_a_broken_payout_contract() {
        let h = harness_with(pending_job("seed"));
        let err = h
            .engine
            .create_job(NewJob {
                requester_id: "req-1".to_string(),
                scheduled_at: Utc::now(),
                duration_minutes: 0,
                gross_price_minor: 10_000,
                fee_rate_bp: 2_000,
                add_ons: vec![],
                location: Location {
                    address: "4 Bay Rd".to_string(),
                    latitude: None,
                    longitude: None,
                },
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn storage_outage_surfaces_as_unavailable() {
        let h = harness_with(pending_job("job-1"));
        h.store.unavailable.store(true, Ordering::SeqCst);
        let err = h.engine.get_job("job-1").await.unwrap_err();
        assert!(matches!(err, EngineError::CollaboratorUnavailable { .. }));
    }
}
