use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::domain::{OnboardingState, StageLabel, VerificationStatus};

#[derive(Debug, Deserialize, Validate)]
pub struct StepRequest {
    #[validate(range(min = 1, max = 50, message = "Step must be between 1 and 50"))]
    pub to_step: i32,
}

/// The provider's progress as the capability view the rest of the platform
/// consumes: derived stage and offer eligibility, never the raw cache.
#[derive(Serialize)]
pub struct OnboardingResponse {
    pub provider_id: String,
    pub current_step: i32,
    pub total_steps: i32,
    pub stage_label: StageLabel,
    pub is_complete: bool,
    pub activated: bool,
    pub verification: VerificationStatus,
    pub eligible_for_offers: bool,
}

impl From<OnboardingState> for OnboardingResponse {
    fn from(state: OnboardingState) -> Self {
        OnboardingResponse {
            stage_label: state.stage_label(),
            eligible_for_offers: state.eligible_for_offers(),
            provider_id: state.provider_id,
            current_step: state.current_step,
            total_steps: state.plan.total_steps,
            is_complete: state.is_complete,
            activated: state.activated,
            verification: state.verification,
        }
    }
}
