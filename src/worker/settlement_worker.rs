use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Semaphore, watch};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::collaborators::notify::{Notifier, NotifyEvent};
use crate::collaborators::settlement::SettlementLedger;
use crate::collaborators::storage::{JobStore, StatusFields, StoreError};
use crate::domain::JobStatus;
use crate::payout;

/// Queue entries that have failed this many claims get flagged for manual
/// reconciliation in the logs (they keep being retried regardless).
const ATTENTION_THRESHOLD: i32 = 10;

/// Background worker draining the deferred-settlement queue: settlements
/// the engine could not record synchronously at `complete` time. For each
/// due entry it re-records the settlement, finishes the interrupted
/// `in_progress -> completed` swap, and drops the queue row.
pub struct SettlementWorker {
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn SettlementLedger>,
    notifier: Arc<dyn Notifier>,
    poll_interval: Duration,
    batch_size: i64,
}

impl SettlementWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn SettlementLedger>,
        notifier: Arc<dyn Notifier>,
        poll_interval: Duration,
        batch_size: i64,
    ) -> Self {
        SettlementWorker {
            store,
            ledger,
            notifier,
            poll_interval,
            batch_size,
        }
    }

    /// Run with semaphore-bounded concurrency until the shutdown channel
    /// flips. Claimed entries are processed in spawned tasks; a claim that
    /// fails stays leased and comes back after the lease window.
    pub async fn run(
        &self,
        worker_id: u32,
        semaphore: Arc<Semaphore>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Settlement worker {} started", worker_id);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.ledger.claim_due(self.batch_size).await {
                Ok(batch) if !batch.is_empty() => {
                    info!(
                        worker_id,
                        claimed = batch.len(),
                        "claimed deferred settlements"
                    );
                    for deferred in batch {
                        let permit = match semaphore.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => return,
                        };
                        if deferred.attempts > ATTENTION_THRESHOLD {
                            error!(
                                job_id = %deferred.job_id,
                                attempts = deferred.attempts,
                                "deferred settlement needs manual reconciliation"
                            );
                        }

                        let store = self.store.clone();
                        let ledger = self.ledger.clone();
                        let notifier = self.notifier.clone();
                        tokio::spawn(async move {
                            if let Err(reason) =
                                drain_one(store, ledger, notifier, &deferred.job_id).await
                            {
                                warn!(
                                    job_id = %deferred.job_id,
                                    attempts = deferred.attempts,
                                    reason = %reason,
                                    "deferred settlement retry failed"
                                );
                            }
                            drop(permit);
                        });
                    }
                }
                Ok(_) => {
                    // Queue empty; wait for work or shutdown.
                    tokio::select! {
                        _ = shutdown_rx.changed() => {}
                        _ = sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(worker_id, error = %e, "settlement queue poll failed");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!("Settlement worker {} stopped", worker_id);
    }
}

/// Settle one deferred job. Safe to re-run in any order: the settlement
/// insert is keyed by job id and the status swap is conditional.
async fn drain_one(
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn SettlementLedger>,
    notifier: Arc<dyn Notifier>,
    job_id: &str,
) -> Result<(), String> {
    let job = store.get_job(job_id).await.map_err(|e| e.to_string())?;

    match job.status {
        JobStatus::Completed => {
            // Another session finished the interrupted completion; the
            // queue entry is stale.
            ledger.resolve(job_id).await.map_err(|e| e.to_string())?;
            Ok(())
        }
        JobStatus::InProgress => {
            let breakdown =
                payout::compute_payout(job.gross_price_minor, job.duration_minutes, job.fee_rate_bp)
                    .map_err(|e| e.to_string())?;
            ledger
                .record_settlement(job_id, &breakdown)
                .await
                .map_err(|e| e.to_string())?;

            let fields = StatusFields {
                completed_at: Some(Utc::now()),
                ..Default::default()
            };
            match store
                .conditional_update_status(job_id, JobStatus::InProgress, JobStatus::Completed, fields)
                .await
            {
                Ok(_)
                | Err(StoreError::Conflict {
                    actual: JobStatus::Completed,
                }) => {}
                Err(e) => return Err(e.to_string()),
            }
            ledger.resolve(job_id).await.map_err(|e| e.to_string())?;

            info!(job_id, net = breakdown.net_payout_minor, "deferred settlement recovered");
            for party in [Some(job.requester_id.clone()), job.fulfiller_id.clone()]
                .into_iter()
                .flatten()
            {
                let event = NotifyEvent::JobCompleted {
                    job_id: job_id.to_string(),
                    net_payout_minor: breakdown.net_payout_minor,
                };
                if let Err(e) = notifier.notify(&party, event).await {
                    warn!(job_id, party = %party, error = %e, "completion notification failed");
                }
            }
            Ok(())
        }
        // A deferred settlement should only exist for a job that was
        // mid-completion. Anything else is kept on the queue and flagged
        // rather than silently dropped.
        other => Err(format!(
            "job is {}, not settleable; leaving queue entry for reconciliation",
            other.as_str()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::collaborators::memory::{MemoryJobStore, MemoryLedger, RecordingNotifier};
    use crate::domain::{Job, Location};

    fn in_progress_job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            status: JobStatus::InProgress,
            requester_id: "req-1".to_string(),
            fulfiller_id: Some("ful-a".to_string()),
            scheduled_at: Utc::now(),
            duration_minutes: 90,
            gross_price_minor: 10_000,
            fee_rate_bp: 2_000,
            add_ons: vec![],
            location: Location {
                address: "4 Bay Rd".to_string(),
                latitude: None,
                longitude: None,
            },
            created_at: Utc::now(),
            accepted_at: Some(Utc::now()),
            completed_at: None,
            cancel_reason: None,
        }
    }

    #[tokio::test]
    async fn recovers_an_interrupted_completion() {
        let store = Arc::new(MemoryJobStore::with_job(in_progress_job("job-1")));
        let ledger = Arc::new(MemoryLedger::new());
        let notifier = Arc::new(RecordingNotifier::new());
        ledger.defer("job-1", "backend was down").await.unwrap();

        drain_one(store.clone(), ledger.clone(), notifier.clone(), "job-1")
            .await
            .unwrap();

        assert_eq!(ledger.settlement_count(), 1);
        assert_eq!(ledger.deferred_count(), 0);
        let job = store.get_job("job-1").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert_eq!(notifier.events().len(), 2);
    }

    #[tokio::test]
    async fn draining_twice_settles_once() {
        let store = Arc::new(MemoryJobStore::with_job(in_progress_job("job-1")));
        let ledger = Arc::new(MemoryLedger::new());
        let notifier = Arc::new(RecordingNotifier::new());
        ledger.defer("job-1", "backend was down").await.unwrap();

        drain_one(store.clone(), ledger.clone(), notifier.clone(), "job-1")
            .await
            .unwrap();
        ledger.defer("job-1", "duplicate enqueue").await.unwrap();
        drain_one(store.clone(), ledger.clone(), notifier.clone(), "job-1")
            .await
            .unwrap();

        assert_eq!(ledger.settlement_count(), 1);
        assert_eq!(ledger.deferred_count(), 0);
    }

    #[tokio::test]
    async fn unsettleable_jobs_stay_queued() {
        let mut job = in_progress_job("job-1");
        job.status = JobStatus::Cancelled;
        let store = Arc::new(MemoryJobStore::with_job(job));
        let ledger = Arc::new(MemoryLedger::new());
        let notifier = Arc::new(RecordingNotifier::new());
        ledger.defer("job-1", "backend was down").await.unwrap();

        let err = drain_one(store, ledger.clone(), notifier, "job-1")
            .await
            .unwrap_err();
        assert!(err.contains("not settleable"));
        assert_eq!(ledger.settlement_count(), 0);
        assert_eq!(ledger.deferred_count(), 1);
    }
}
