use actix_web::{
    HttpResponse, get, post,
    web::{Data, Path, ServiceConfig, scope},
};
use actix_web_validator::Json;

use super::dto::{OnboardingResponse, StepRequest};
use crate::engine::{OnboardingError, OnboardingTracker};

#[get("/{provider_id}/onboarding")]
async fn get_onboarding(
    tracker: Data<OnboardingTracker>,
    path: Path<String>,
) -> Result<HttpResponse, OnboardingError> {
    let state = tracker.get(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(OnboardingResponse::from(state)))
}

#[post("/{provider_id}/onboarding/advance")]
async fn advance_onboarding(
    tracker: Data<OnboardingTracker>,
    path: Path<String>,
    body: Json<StepRequest>,
) -> Result<HttpResponse, OnboardingError> {
    let state = tracker.advance(&path.into_inner(), body.to_step).await?;
    Ok(HttpResponse::Ok().json(OnboardingResponse::from(state)))
}

#[post("/{provider_id}/onboarding/rewind")]
async fn rewind_onboarding(
    tracker: Data<OnboardingTracker>,
    path: Path<String>,
    body: Json<StepRequest>,
) -> Result<HttpResponse, OnboardingError> {
    let state = tracker.rewind(&path.into_inner(), body.to_step).await?;
    Ok(HttpResponse::Ok().json(OnboardingResponse::from(state)))
}

/// Terminal confirmation of the final step: runs the resource-creating
/// sub-steps, then freezes the state as complete.
#[post("/{provider_id}/onboarding/complete")]
async fn complete_onboarding(
    tracker: Data<OnboardingTracker>,
    path: Path<String>,
) -> Result<HttpResponse, OnboardingError> {
    let state = tracker.complete(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(OnboardingResponse::from(state)))
}

#[post("/{provider_id}/onboarding/activate")]
async fn activate_provider(
    tracker: Data<OnboardingTracker>,
    path: Path<String>,
) -> Result<HttpResponse, OnboardingError> {
    let state = tracker.activate(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(OnboardingResponse::from(state)))
}

pub fn onboarding_config(config: &mut ServiceConfig) {
    config.service(
        scope("providers")
            .service(get_onboarding)
            .service(advance_onboarding)
            .service(rewind_onboarding)
            .service(complete_onboarding)
            .service(activate_provider),
    );
}
