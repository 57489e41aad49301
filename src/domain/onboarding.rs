use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse capability tier derived from onboarding progress. Gates whether a
/// provider profile can receive job offers.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageLabel {
    Applicant,
    ServiceDefined,
    Staging,
    Live,
}

impl StageLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageLabel::Applicant => "applicant",
            StageLabel::ServiceDefined => "service_defined",
            StageLabel::Staging => "staging",
            StageLabel::Live => "live",
        }
    }
}

/// Step thresholds at which a profile crosses into the next stage. These
/// are configuration: the onboarding flow ships in several variants with
/// different step counts and threshold placement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageThresholds {
    pub service_defined: i32,
    pub live: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OnboardingPlan {
    pub total_steps: i32,
    pub thresholds: StageThresholds,
}

impl OnboardingPlan {
    pub fn clamp_step(&self, step: i32) -> i32 {
        step.clamp(1, self.total_steps)
    }
}

/// Whether the provider's identity has been verified, and when.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationStatus {
    Unverified,
    Verified { since: DateTime<Utc> },
}

/// Progress of one provider through their onboarding variant.
///
/// `stage_label()` is always recomputed from the step position; storage may
/// cache it for query convenience but the cache is never read back as truth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OnboardingState {
    pub provider_id: String,
    pub current_step: i32,
    pub plan: OnboardingPlan,
    pub is_complete: bool,
    pub activated: bool,
    pub verification: VerificationStatus,
    pub updated_at: DateTime<Utc>,
}

impl OnboardingState {
    pub fn new(provider_id: String, plan: OnboardingPlan, now: DateTime<Utc>) -> Self {
        OnboardingState {
            provider_id,
            current_step: 1,
            plan,
            is_complete: false,
            activated: false,
            verification: VerificationStatus::Unverified,
            updated_at: now,
        }
    }

    pub fn stage_label(&self) -> StageLabel {
        if self.activated {
            StageLabel::Live
        } else if self.current_step >= self.plan.thresholds.live {
            StageLabel::Staging
        } else if self.current_step >= self.plan.thresholds.service_defined {
            StageLabel::ServiceDefined
        } else {
            StageLabel::Applicant
        }
    }

    /// Offer eligibility requires a finished, verified, activated profile.
    pub fn eligible_for_offers(&self) -> bool {
        match self.verification {
            VerificationStatus::Unverified => false,
            VerificationStatus::Verified { .. } => self.is_complete && self.activated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> OnboardingPlan {
        OnboardingPlan {
            total_steps: 5,
            thresholds: StageThresholds { service_defined: 2, live: 5 },
        }
    }

    fn state_at(step: i32) -> OnboardingState {
        let mut s = OnboardingState::new("prov-1".into(), plan(), Utc::now());
        s.current_step = step;
        s
    }

    #[test]
    fn stage_follows_thresholds() {
        assert_eq!(state_at(1).stage_label(), StageLabel::Applicant);
        assert_eq!(state_at(2).stage_label(), StageLabel::ServiceDefined);
        assert_eq!(state_at(3).stage_label(), StageLabel::ServiceDefined);
        assert_eq!(state_at(5).stage_label(), StageLabel::Staging);
    }

    #[test]
    fn completed_profile_stays_in_staging_until_activated() {
        let mut s = state_at(5);
        s.is_complete = true;
        s.verification = VerificationStatus::Verified { since: Utc::now() };
        assert_eq!(s.stage_label(), StageLabel::Staging);
        assert!(!s.eligible_for_offers());

        s.activated = true;
        assert_eq!(s.stage_label(), StageLabel::Live);
        assert!(s.eligible_for_offers());
    }

    #[test]
    fn unverified_profile_never_receives_offers() {
        let mut s = state_at(5);
        s.is_complete = true;
        s.activated = true;
        assert!(!s.eligible_for_offers());
    }

    #[test]
    fn variants_place_thresholds_differently() {
        let mut s = OnboardingState::new(
            "prov-2".into(),
            OnboardingPlan {
                total_steps: 8,
                thresholds: StageThresholds { service_defined: 3, live: 7 },
            },
            Utc::now(),
        );
        s.current_step = 6;
        assert_eq!(s.stage_label(), StageLabel::ServiceDefined);
        s.current_step = 7;
        assert_eq!(s.stage_label(), StageLabel::Staging);
    }

    #[test]
    fn step_clamping_respects_plan_bounds() {
        let p = plan();
        assert_eq!(p.clamp_step(0), 1);
        assert_eq!(p.clamp_step(3), 3);
        assert_eq!(p.clamp_step(99), 5);
    }
}
