use std::fmt;
use std::sync::Arc;

use actix_web::{HttpResponse, ResponseError};
use chrono::Utc;
use tracing::{info, warn};

use crate::api::validation::ErrorResponse;
use crate::collaborators::assets::{AssetCatalog, AssetKind};
use crate::collaborators::storage::{OnboardingStore, StoreError};
use crate::domain::{OnboardingPlan, OnboardingState};
use crate::engine::retry::{RetryFailure, RetryPolicy};

/// Sub-steps of the final onboarding step that create external resources.
/// Each is idempotent under `(provider_id, kind)`, so a crash mid-way
/// resumes without duplicating anything.
const FINAL_STEP_ASSETS: [AssetKind; 2] = [AssetKind::IdentityDocument, AssetKind::ServicePackage];

#[derive(Debug)]
pub enum OnboardingError {
    NotFound(String),
    /// Completion requested before the last step's data is in place.
    NotAtFinalStep { current: i32, total: i32 },
    /// The state froze when completion was recorded; rewinds are over.
    Immutable(String),
    /// Activation requested before completion.
    NotComplete(String),
    Unavailable {
        collaborator: &'static str,
        detail: String,
    },
}

impl fmt::Display for OnboardingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnboardingError::NotFound(provider_id) => {
                write!(f, "no onboarding state for provider {}", provider_id)
            }
            OnboardingError::NotAtFinalStep { current, total } => write!(
                f,
                "cannot complete onboarding at step {} of {}",
                current, total
            ),
            OnboardingError::Immutable(provider_id) => write!(
                f,
                "onboarding for provider {} is complete and read-only",
                provider_id
            ),
            OnboardingError::NotComplete(provider_id) => write!(
                f,
                "provider {} has not completed onboarding",
                provider_id
            ),
            OnboardingError::Unavailable { collaborator, detail } => {
                write!(f, "{} unavailable: {}", collaborator, detail)
            }
        }
    }
}

impl std::error::Error for OnboardingError {}

impl ResponseError for OnboardingError {
    fn error_response(&self) -> HttpResponse {
        let body = ErrorResponse {
            error: "Onboarding error".to_string(),
            fields: serde_json::json!({"message": self.to_string()}),
        };
        match self {
            OnboardingError::NotFound(_) => HttpResponse::NotFound().json(body),
            OnboardingError::NotAtFinalStep { .. }
            | OnboardingError::Immutable(_)
            | OnboardingError::NotComplete(_) => HttpResponse::Conflict().json(body),
            OnboardingError::Unavailable { .. } => HttpResponse::ServiceUnavailable().json(body),
        }
    }
}

/// Step-indexed progress tracker gating provider capabilities.
///
/// Progress is persisted through monotonic upserts, so partial progress
/// survives interruptions and concurrent sessions converge on the furthest
/// step. The configured plan only shapes newly created rows; existing rows
/// keep the variant they started under.
pub struct OnboardingTracker {
    store: Arc<dyn OnboardingStore>,
    assets: Arc<dyn AssetCatalog>,
    plan: OnboardingPlan,
    retry: RetryPolicy,
}

impl OnboardingTracker {
    pub fn new(
        store: Arc<dyn OnboardingStore>,
        assets: Arc<dyn AssetCatalog>,
        plan: OnboardingPlan,
        retry: RetryPolicy,
    ) -> Self {
        OnboardingTracker {
            store,
            assets,
            plan,
            retry,
        }
    }

    pub async fn get(&self, provider_id: &str) -> Result<OnboardingState, OnboardingError> {
        self.retry
            .run("storage.onboarding_get", || self.store.get(provider_id))
            .await
            .map_err(Self::storage_failure)?
            .ok_or_else(|| OnboardingError::NotFound(provider_id.to_string()))
    }

    /// Move forward to `to_step`, clamped to the plan. Never decreases:
    /// advancing to an already-passed step is a harmless no-op, which is
    /// what makes resume-after-relaunch safe.
    pub async fn advance(
        &self,
        provider_id: &str,
        to_step: i32,
    ) -> Result<OnboardingState, OnboardingError> {
        let step = self.plan.clamp_step(to_step);
        let state = self
            .retry
            .run("storage.onboarding_advance", || {
                self.store.advance(provider_id, step, &self.plan)
            })
            .await
            .map_err(Self::storage_failure)?;
        self.refresh_cache(&state).await;
        info!(provider_id, step = state.current_step, "onboarding advanced");
        Ok(state)
    }

    /// Explicit go-back for UI back-navigation. Never increases, and
    /// refused outright once the state is complete.
    pub async fn rewind(
        &self,
        provider_id: &str,
        to_step: i32,
    ) -> Result<OnboardingState, OnboardingError> {
        let state = self.get(provider_id).await?;
        let step = state.plan.clamp_step(to_step);
        let state = self
            .retry
            .run("storage.onboarding_rewind", || {
                self.store.rewind(provider_id, step)
            })
            .await
            .map_err(|failure| match failure {
                RetryFailure::Fatal(StoreError::Refused(_)) => {
                    OnboardingError::Immutable(provider_id.to_string())
                }
                other => Self::storage_failure(other),
            })?;
        self.refresh_cache(&state).await;
        info!(provider_id, step = state.current_step, "onboarding rewound");
        Ok(state)
    }

    /// Terminal confirmation of the final step. Reaching the last step's
    /// data is not enough: the step's resource-creating sub-steps must all
    /// succeed first. Any failure leaves the tracker exactly where it was,
    /// and re-invocation resumes without duplicating resources.
    pub async fn complete(&self, provider_id: &str) -> Result<OnboardingState, OnboardingError> {
        let state = self.get(provider_id).await?;
        if state.is_complete {
            return Ok(state);
        }
        if state.current_step != state.plan.total_steps {
            return Err(OnboardingError::NotAtFinalStep {
                current: state.current_step,
                total: state.plan.total_steps,
            });
        }

        for kind in FINAL_STEP_ASSETS {
            let asset_id = self
                .retry
                .run("assets.ensure", || self.assets.ensure(provider_id, kind))
                .await
                .map_err(|failure| {
                    warn!(
                        provider_id,
                        asset = kind.as_str(),
                        "final onboarding sub-step failed; state left resumable"
                    );
                    match failure {
                        RetryFailure::Fatal(err) => OnboardingError::Unavailable {
                            collaborator: "assets",
                            detail: err.to_string(),
                        },
                        RetryFailure::Exhausted { last, .. } => OnboardingError::Unavailable {
                            collaborator: "assets",
                            detail: last,
                        },
                    }
                })?;
            info!(provider_id, asset = kind.as_str(), asset_id = %asset_id, "onboarding asset ensured");
        }

        let state = self
            .retry
            .run("storage.onboarding_complete", || {
                self.store.mark_complete(provider_id, Utc::now())
            })
            .await
            .map_err(|failure| match failure {
                RetryFailure::Fatal(StoreError::Refused(_)) => OnboardingError::NotAtFinalStep {
                    current: state.current_step,
                    total: state.plan.total_steps,
                },
                other => Self::storage_failure(other),
            })?;
        self.refresh_cache(&state).await;
        info!(provider_id, "onboarding complete");
        Ok(state)
    }

    /// Flip a completed profile into the live tier, making it eligible for
    /// job offers.
    pub async fn activate(&self, provider_id: &str) -> Result<OnboardingState, OnboardingError> {
        let state = self
            .retry
            .run("storage.onboarding_activate", || {
                self.store.mark_activated(provider_id)
            })
            .await
            .map_err(|failure| match failure {
                RetryFailure::Fatal(StoreError::Refused(_)) => {
                    OnboardingError::NotComplete(provider_id.to_string())
                }
                other => Self::storage_failure(other),
            })?;
        self.refresh_cache(&state).await;
        info!(provider_id, "provider activated");
        Ok(state)
    }

    /// Keep the redundant stage column in storage roughly current. Best
    /// effort only; reads always recompute.
    async fn refresh_cache(&self, state: &OnboardingState) {
        let label = state.stage_label();
        if let Err(err) = self
            .store
            .refresh_stage_cache(&state.provider_id, label.as_str())
            .await
        {
            warn!(provider_id = %state.provider_id, error = %err, "stage cache refresh failed");
        }
    }

    fn storage_failure(failure: RetryFailure<StoreError>) -> OnboardingError {
        match failure {
            RetryFailure::Fatal(StoreError::NotFound) => OnboardingError::Unavailable {
                collaborator: "storage",
                detail: "row vanished mid-operation".to_string(),
            },
            RetryFailure::Fatal(err) => OnboardingError::Unavailable {
                collaborator: "storage",
                detail: err.to_string(),
            },
            RetryFailure::Exhausted { last, .. } => OnboardingError::Unavailable {
                collaborator: "storage",
                detail: last,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::collaborators::memory::{MemoryAssetCatalog, MemoryOnboardingStore};
    use crate::domain::{StageLabel, StageThresholds, VerificationStatus};

    struct Harness {
        tracker: OnboardingTracker,
        assets: Arc<MemoryAssetCatalog>,
    }

    fn harness() -> Harness {
        let assets = Arc::new(MemoryAssetCatalog::new());
        let tracker = OnboardingTracker::new(
            Arc::new(MemoryOnboardingStore::new()),
            assets.clone(),
            OnboardingPlan {
                total_steps: 5,
                thresholds: StageThresholds { service_defined: 2, live: 5 },
            },
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                call_timeout: Duration::from_millis(250),
            },
        );
        Harness { tracker, assets }
    }

    #[tokio::test]
    async fn advance_never_decreases() {
        let h = harness();
        let state = h.tracker.advance("prov-1", 3).await.unwrap();
        assert_eq!(state.current_step, 3);
        assert_eq!(state.stage_label(), StageLabel::ServiceDefined);

        // A stale session reporting an earlier step changes nothing.
        let state = h.tracker.advance("prov-1", 2).await.unwrap();
        assert_eq!(state.current_step, 3);
    }

    #[tokio::test]
    async fn advance_clamps_to_the_plan() {
        let h = harness();
        let state = h.tracker.advance("prov-1", 42).await.unwrap();
        assert_eq!(state.current_step, 5);
        let state = h.tracker.advance("prov-2", -3).await.unwrap();
        assert_eq!(state.current_step, 1);
    }

    #[tokio::test]
    async fn concurrent_sessions_converge_on_the_furthest_step() {
        let h = harness();
        let tracker = Arc::new(h.tracker);
        let (a, b) = tokio::join!(
            {
                let t = tracker.clone();
                tokio::spawn(async move { t.advance("prov-1", 2).await })
            },
            {
                let t = tracker.clone();
                tokio::spawn(async move { t.advance("prov-1", 4).await })
            }
        );
        a.unwrap().unwrap();
        b.unwrap().unwrap();
        assert_eq!(tracker.get("prov-1").await.unwrap().current_step, 4);
    }

    #[tokio::test]
    async fn rewind_never_increases() {
        let h = harness();
        h.tracker.advance("prov-1", 4).await.unwrap();
        let state = h.tracker.rewind("prov-1", 2).await.unwrap();
        assert_eq!(state.current_step, 2);
        let state = h.tracker.rewind("prov-1", 5).await.unwrap();
        assert_eq!(state.current_step, 2);
    }

    #[tokio::test]
    async fn completion_needs_the_final_step() {
        let h = harness();
        h.tracker.advance("prov-1", 4).await.unwrap();
        let err = h.tracker.complete("prov-1").await.unwrap_err();
        assert!(matches!(
            err,
            OnboardingError::NotAtFinalStep { current: 4, total: 5 }
        ));
        assert!(!h.tracker.get("prov-1").await.unwrap().is_complete);
    }

    #[tokio::test]
    async fn completion_verifies_and_lands_in_staging() {
        let h = harness();
        h.tracker.advance("prov-1", 5).await.unwrap();
        let state = h.tracker.complete("prov-1").await.unwrap();

        assert!(state.is_complete);
        assert!(matches!(
            state.verification,
            VerificationStatus::Verified { .. }
        ));
        assert_eq!(state.stage_label(), StageLabel::Staging);
        assert!(!state.eligible_for_offers());
        assert_eq!(h.assets.created_count(), 2);
    }

    #[tokio::test]
    async fn failed_sub_step_is_resumable_without_duplicates() {
        let h = harness();
        h.tracker.advance("prov-1", 5).await.unwrap();
        h.assets.fail_service_package.store(true, Ordering::SeqCst);

        let err = h.tracker.complete("prov-1").await.unwrap_err();
        assert!(matches!(err, OnboardingError::Unavailable { .. }));
        let state = h.tracker.get("prov-1").await.unwrap();
        assert!(!state.is_complete);
        assert_eq!(state.current_step, 5);
        // The document record landed before the failure.
        assert_eq!(h.assets.created_count(), 1);

        // Retry after the outage: resumes, and the surviving asset is
        // reused rather than recreated.
        h.assets.fail_service_package.store(false, Ordering::SeqCst);
        let state = h.tracker.complete("prov-1").await.unwrap();
        assert!(state.is_complete);
        assert_eq!(h.assets.created_count(), 2);
    }

    #[tokio::test]
    async fn completion_is_idempotent() {
        let h = harness();
        h.tracker.advance("prov-1", 5).await.unwrap();
        let first = h.tracker.complete("prov-1").await.unwrap();
        let again = h.tracker.complete("prov-1").await.unwrap();
        assert_eq!(first.verification, again.verification);
        assert_eq!(h.assets.created_count(), 2);
        assert_eq!(h.assets.creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn completed_state_is_read_only_for_rewind() {
        let h = harness();
        h.tracker.advance("prov-1", 5).await.unwrap();
        h.tracker.complete("prov-1").await.unwrap();
        let err = h.tracker.rewind("prov-1", 1).await.unwrap_err();
        assert!(matches!(err, OnboardingError::Immutable(_)));
        assert_eq!(h.tracker.get("prov-1").await.unwrap().current_step, 5);
    }

    #[tokio::test]
    async fn activation_requires_completion_and_unlocks_offers() {
        let h = harness();
        h.tracker.advance("prov-1", 5).await.unwrap();
        let err = h.tracker.activate("prov-1").await.unwrap_err();
        assert!(matches!(err, OnboardingError::NotComplete(_)));

        h.tracker.complete("prov-1").await.unwrap();
        let state = h.tracker.activate("prov-1").await.unwrap();
        assert_eq!(state.stage_label(), StageLabel::Live);
        assert!(state.eligible_for_offers());
    }

    #[tokio::test]
    async fn unknown_provider_reads_as_not_found() {
        let h = harness();
        let err = h.tracker.get("ghost").await.unwrap_err();
        assert!(matches!(err, OnboardingError::NotFound(_)));
    }
}
