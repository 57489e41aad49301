//! In-memory collaborator implementations backing the engine tests. They
//! honor the same atomicity contracts as the Postgres repositories: the
//! status CAS happens under one lock, keyed writes are idempotent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::collaborators::assets::{AssetCatalog, AssetError, AssetKind};
use crate::collaborators::geo::{GeoLocator, GeoPoint};
use crate::collaborators::notify::{Notifier, NotifyEvent};
use crate::collaborators::settlement::{DeferredSettlement, LedgerError, SettlementLedger};
use crate::collaborators::storage::{
    JobAuditEntry, JobStore, OnboardingStore, StatusFields, StoreError,
};
use crate::domain::{Job, JobStatus, OnboardingPlan, OnboardingState, VerificationStatus};
use crate::payout::PayoutBreakdown;

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
    audits: Mutex<Vec<JobAuditEntry>>,
    pub unavailable: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job(job: Job) -> Self {
        let store = Self::default();
        store.jobs.lock().unwrap().insert(job.id.clone(), job);
        store
    }

    pub fn audit_entries(&self) -> Vec<JobAuditEntry> {
        self.audits.lock().unwrap().clone()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get_job(&self, job_id: &str) -> Result<Job, StoreError> {
        self.check_available()?;
        self.jobs
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn insert_job(&self, job: &Job) -> Result<Job, StoreError> {
        self.check_available()?;
        self.jobs
            .lock()
            .unwrap()
            .insert(job.id.clone(), job.clone());
        Ok(job.clone())
    }

    async fn conditional_update_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        new: JobStatus,
        fields: StatusFields,
    ) -> Result<Job, StoreError> {
        self.check_available()?;
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(job_id).ok_or(StoreError::NotFound)?;
        if job.status != expected {
            return Err(StoreError::Conflict { actual: job.status });
        }
        job.status = new;
        if let Some(fulfiller) = fields.fulfiller_id {
            job.fulfiller_id = Some(fulfiller);
        }
        if let Some(at) = fields.accepted_at {
            job.accepted_at = Some(at);
        }
        if let Some(at) = fields.completed_at {
            job.completed_at = Some(at);
        }
        if let Some(reason) = fields.cancel_reason {
            job.cancel_reason = Some(reason);
        }
        Ok(job.clone())
    }

    async fn record_audit(&self, entry: JobAuditEntry) -> Result<(), StoreError> {
        self.check_available()?;
        self.audits.lock().unwrap().push(entry);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<HashMap<String, PayoutBreakdown>>,
    queue: Mutex<HashMap<String, DeferredSettlement>>,
    pub record_calls: AtomicUsize,
    pub reject_records: AtomicBool,
    pub unavailable: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settlement_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn settlement_for(&self, job_id: &str) -> Option<PayoutBreakdown> {
        self.records.lock().unwrap().get(job_id).cloned()
    }

    pub fn deferred_count(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[async_trait]
impl SettlementLedger for MemoryLedger {
    async fn record_settlement(
        &self,
        job_id: &str,
        breakdown: &PayoutBreakdown,
    ) -> Result<(), LedgerError> {
        self.record_calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("ledger offline".into()));
        }
        if self.reject_records.load(Ordering::SeqCst) {
            return Err(LedgerError::Rejected("payout account suspended".into()));
        }
        // Keyed by job id: re-recording is a no-op, exactly like the
        // ON CONFLICT DO NOTHING insert in Postgres.
        self.records
            .lock()
            .unwrap()
            .entry(job_id.to_string())
            .or_insert_with(|| breakdown.clone());
        Ok(())
    }

    async fn defer(&self, job_id: &str, _reason: &str) -> Result<(), LedgerError> {
        let mut queue = self.queue.lock().unwrap();
        let entry = queue
            .entry(job_id.to_string())
            .or_insert_with(|| DeferredSettlement {
                job_id: job_id.to_string(),
                attempts: 0,
                next_attempt_at: Utc::now(),
            });
        entry.attempts += 1;
        Ok(())
    }

    async fn claim_due(&self, limit: i64) -> Result<Vec<DeferredSettlement>, LedgerError> {
        let now = Utc::now();
        let mut queue = self.queue.lock().unwrap();
        let mut due: Vec<DeferredSettlement> = Vec::new();
        for entry in queue.values_mut() {
            if due.len() as i64 >= limit {
                break;
            }
            if entry.next_attempt_at <= now {
                entry.attempts += 1;
                entry.next_attempt_at = now + ChronoDuration::seconds(60);
                due.push(entry.clone());
            }
        }
        Ok(due)
    }

    async fn resolve(&self, job_id: &str) -> Result<(), LedgerError> {
        self.queue.lock().unwrap().remove(job_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryOnboardingStore {
    rows: Mutex<HashMap<String, OnboardingState>>,
}

impl MemoryOnboardingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OnboardingStore for MemoryOnboardingStore {
    async fn get(&self, provider_id: &str) -> Result<Option<OnboardingState>, StoreError> {
        Ok(self.rows.lock().unwrap().get(provider_id).cloned())
    }

    async fn advance(
        &self,
        provider_id: &str,
        to_step: i32,
        plan: &OnboardingPlan,
    ) -> Result<OnboardingState, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let state = rows
            .entry(provider_id.to_string())
            .or_insert_with(|| OnboardingState::new(provider_id.to_string(), *plan, Utc::now()));
        if to_step > state.current_step {
            state.current_step = to_step;
            state.updated_at = Utc::now();
        }
        Ok(state.clone())
    }

    async fn rewind(&self, provider_id: &str, to_step: i32) -> Result<OnboardingState, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let state = rows.get_mut(provider_id).ok_or(StoreError::NotFound)?;
        if state.is_complete {
            return Err(StoreError::Refused("state is complete and read-only".into()));
        }
        if to_step < state.current_step {
            state.current_step = to_step;
            state.updated_at = Utc::now();
        }
        Ok(state.clone())
    }

    async fn mark_complete(
        &self,
        provider_id: &str,
        verified_since: DateTime<Utc>,
    ) -> Result<OnboardingState, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let state = rows.get_mut(provider_id).ok_or(StoreError::NotFound)?;
        if state.current_step != state.plan.total_steps {
            return Err(StoreError::Refused("not at the final step".into()));
        }
        if !state.is_complete {
            state.is_complete = true;
            state.verification = VerificationStatus::Verified { since: verified_since };
            state.updated_at = Utc::now();
        }
        Ok(state.clone())
    }

    async fn mark_activated(&self, provider_id: &str) -> Result<OnboardingState, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let state = rows.get_mut(provider_id).ok_or(StoreError::NotFound)?;
        if !state.is_complete {
            return Err(StoreError::Refused("not complete".into()));
        }
        state.activated = true;
        state.updated_at = Utc::now();
        Ok(state.clone())
    }

    async fn refresh_stage_cache(&self, _provider_id: &str, _label: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAssetCatalog {
    created: Mutex<HashMap<(String, AssetKind), String>>,
    pub creates: AtomicUsize,
    pub fail_service_package: AtomicBool,
}

impl MemoryAssetCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl AssetCatalog for MemoryAssetCatalog {
    async fn ensure(&self, provider_id: &str, kind: AssetKind) -> Result<String, AssetError> {
        if kind == AssetKind::ServicePackage && self.fail_service_package.load(Ordering::SeqCst) {
            return Err(AssetError("package storage offline".into()));
        }
        let mut created = self.created.lock().unwrap();
        let key = (provider_id.to_string(), kind);
        if let Some(existing) = created.get(&key) {
            return Ok(existing.clone());
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        let id = Uuid::new_v4().to_string();
        created.insert(key, id.clone());
        Ok(id)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(String, NotifyEvent)>>,
    pub fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, NotifyEvent)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, party_id: &str, event: NotifyEvent) -> Result<(), String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err("push gateway rejected".into());
        }
        self.events
            .lock()
            .unwrap()
            .push((party_id.to_string(), event));
        Ok(())
    }
}

pub struct FixedGeoLocator(pub GeoPoint);

#[async_trait]
impl GeoLocator for FixedGeoLocator {
    async fn locate(&self, _provider_id: &str) -> Option<GeoPoint> {
        Some(self.0)
    }
}
