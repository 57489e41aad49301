use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use crate::domain::Job;

struct MirrorEntry {
    confirmed: Job,
    optimistic: Option<Job>,
}

/// In-memory cache of the jobs a device is currently viewing.
///
/// Lifecycle transitions are applied here optimistically before the
/// authoritative conditional write lands, then either confirmed or rolled
/// back. The mirror is display state only: money and exclusivity decisions
/// always go back to storage. Callers hold and pass an instance; there is
/// no process-wide mirror.
pub struct LocalMirror {
    entries: RwLock<HashMap<String, MirrorEntry>>,
}

impl LocalMirror {
    pub fn new() -> Self {
        LocalMirror {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Current view of a job: the optimistic overlay when one is pending,
    /// otherwise the last confirmed snapshot.
    pub fn get(&self, job_id: &str) -> Option<Job> {
        let entries = self.entries.read().expect("mirror lock poisoned");
        entries
            .get(job_id)
            .map(|e| e.optimistic.clone().unwrap_or_else(|| e.confirmed.clone()))
    }

    /// Overlay a not-yet-confirmed transition. A job never seen before is
    /// seeded so the rollback path has a confirmed state to fall back to.
    pub fn apply_optimistic(&self, projected: Job) {
        let mut entries = self.entries.write().expect("mirror lock poisoned");
        match entries.get_mut(&projected.id) {
            Some(entry) => entry.optimistic = Some(projected),
            None => {
                entries.insert(
                    projected.id.clone(),
                    MirrorEntry {
                        confirmed: projected.clone(),
                        optimistic: Some(projected),
                    },
                );
            }
        }
    }

    /// Promote an authoritative write result to the confirmed snapshot and
    /// drop any overlay.
    pub fn confirm(&self, job: Job) {
        let mut entries = self.entries.write().expect("mirror lock poisoned");
        entries.insert(
            job.id.clone(),
            MirrorEntry {
                confirmed: job,
                optimistic: None,
            },
        );
    }

    /// Drop the optimistic overlay after a failed write, reverting to the
    /// last confirmed state.
    pub fn rollback(&self, job_id: &str) {
        let mut entries = self.entries.write().expect("mirror lock poisoned");
        if let Some(entry) = entries.get_mut(job_id) {
            if entry.optimistic.take().is_some() {
                debug!(job_id, "mirror rolled back to confirmed state");
            }
        }
    }

    /// An authoritative read always wins over whatever the mirror held;
    /// desync is corrected silently here, never surfaced to the caller.
    pub fn reconcile(&self, job: Job) {
        self.confirm(job);
    }

    pub fn evict(&self, job_id: &str) {
        let mut entries = self.entries.write().expect("mirror lock poisoned");
        entries.remove(job_id);
    }
}

impl Default for LocalMirror {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobStatus, Location};
    use chrono::Utc;

    fn job(status: JobStatus) -> Job {
        Job {
            id: "job-1".into(),
            status,
            requester_id: "req-1".into(),
            fulfiller_id: None,
            scheduled_at: Utc::now(),
            duration_minutes: 60,
            gross_price_minor: 10_000,
            fee_rate_bp: 2_000,
            add_ons: vec![],
            location: Location {
                address: "12 Hill St".into(),
                latitude: None,
                longitude: None,
            },
            created_at: Utc::now(),
            accepted_at: None,
            completed_at: None,
            cancel_reason: None,
        }
    }

    #[test]
    fn overlay_is_visible_until_rolled_back() {
        let mirror = LocalMirror::new();
        mirror.confirm(job(JobStatus::Pending));

        let mut projected = job(JobStatus::Accepted);
        projected.fulfiller_id = Some("ful-1".into());
        mirror.apply_optimistic(projected);
        assert_eq!(mirror.get("job-1").unwrap().status, JobStatus::Accepted);

        mirror.rollback("job-1");
        let view = mirror.get("job-1").unwrap();
        assert_eq!(view.status, JobStatus::Pending);
        assert_eq!(view.fulfiller_id, None);
    }

    #[test]
    fn confirm_clears_the_overlay() {
        let mirror = LocalMirror::new();
        mirror.confirm(job(JobStatus::Pending));
        mirror.apply_optimistic(job(JobStatus::Accepted));
        mirror.confirm(job(JobStatus::Accepted));
        mirror.rollback("job-1"); // nothing pending; must be a no-op
        assert_eq!(mirror.get("job-1").unwrap().status, JobStatus::Accepted);
    }

    #[test]
    fn reconcile_overrides_stale_optimism() {
        let mirror = LocalMirror::new();
        mirror.confirm(job(JobStatus::Pending));
        mirror.apply_optimistic(job(JobStatus::Accepted));
        // Another device cancelled the job in the meantime.
        mirror.reconcile(job(JobStatus::Cancelled));
        assert_eq!(mirror.get("job-1").unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn unknown_jobs_read_as_absent() {
        let mirror = LocalMirror::new();
        assert!(mirror.get("nope").is_none());
        mirror.confirm(job(JobStatus::Pending));
        mirror.evict("job-1");
        assert!(mirror.get("job-1").is_none());
    }
}
