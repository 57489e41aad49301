use actix_web::{
    HttpResponse, get, post,
    web::{Data, Path, ServiceConfig, scope},
};
use actix_web_validator::Json;

use super::dto::{
    CancelRequest, CompletionResponse, CreateJobRequest, DelayRequest, FulfillerRequest,
    JobResponse, MessageResponse,
};
use crate::config::Config;
use crate::domain::Location;
use crate::engine::{EngineError, LifecycleEngine, NewJob};
use crate::payout;

#[post("")]
async fn create_job(
    engine: Data<LifecycleEngine>,
    config: Data<Config>,
    body: Json<CreateJobRequest>,
) -> Result<HttpResponse, EngineError> {
    let body = body.into_inner();
    let fee_rate_bp = body
        .fee_rate_percent
        .map(payout::fee_rate_bp_from_fraction)
        .unwrap_or(config.default_fee_rate_bp);

    let job = engine
        .create_job(NewJob {
            requester_id: body.requester_id,
            scheduled_at: body.scheduled_at,
            duration_minutes: body.duration_minutes,
            gross_price_minor: body.gross_price_minor,
            fee_rate_bp,
            add_ons: body.add_ons,
            location: Location {
                address: body.address,
                latitude: body.latitude,
                longitude: body.longitude,
            },
        })
        .await?;
    Ok(HttpResponse::Created().json(JobResponse {
        message: "Job created successfully".to_string(),
        job,
    }))
}

#[get("/{job_id}")]
async fn get_job(
    engine: Data<LifecycleEngine>,
    path: Path<String>,
) -> Result<HttpResponse, EngineError> {
    let job = engine.get_job(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(JobResponse {
        message: "Job fetched".to_string(),
        job,
    }))
}

/// The provider-facing earnings view of a job, derived on demand.
#[get("/{job_id}/payout")]
async fn job_payout(
    engine: Data<LifecycleEngine>,
    path: Path<String>,
) -> Result<HttpResponse, EngineError> {
    let job = engine.get_job(&path.into_inner()).await?;
    let breakdown =
        payout::compute_payout(job.gross_price_minor, job.duration_minutes, job.fee_rate_bp)?;
    Ok(HttpResponse::Ok().json(breakdown))
}

#[post("/{job_id}/accept")]
async fn accept_job(
    engine: Data<LifecycleEngine>,
    path: Path<String>,
    body: Json<FulfillerRequest>,
) -> Result<HttpResponse, EngineError> {
    let job = engine.accept(&path.into_inner(), &body.fulfiller_id).await?;
    Ok(HttpResponse::Ok().json(JobResponse {
        message: "Offer accepted".to_string(),
        job,
    }))
}

#[post("/{job_id}/decline")]
async fn decline_job(
    engine: Data<LifecycleEngine>,
    path: Path<String>,
    body: Json<FulfillerRequest>,
) -> Result<HttpResponse, EngineError> {
    engine.decline(&path.into_inner(), &body.fulfiller_id).await?;
    Ok(HttpResponse::Ok().json(MessageResponse {
        message: "Offer declined".to_string(),
    }))
}

#[post("/{job_id}/travel")]
async fn start_travel(
    engine: Data<LifecycleEngine>,
    path: Path<String>,
    body: Json<FulfillerRequest>,
) -> Result<HttpResponse, EngineError> {
    let job = engine
        .start_travel(&path.into_inner(), &body.fulfiller_id)
        .await?;
    Ok(HttpResponse::Ok().json(JobResponse {
        message: "Travel started".to_string(),
        job,
    }))
}

#[post("/{job_id}/delay")]
async fn report_delay(
    engine: Data<LifecycleEngine>,
    path: Path<String>,
    body: Json<DelayRequest>,
) -> Result<HttpResponse, EngineError> {
    engine
        .report_delay(&path.into_inner(), &body.fulfiller_id, body.minutes)
        .await?;
    Ok(HttpResponse::Ok().json(MessageResponse {
        message: "Delay reported".to_string(),
    }))
}

#[post("/{job_id}/begin")]
async fn begin_work(
    engine: Data<LifecycleEngine>,
    path: Path<String>,
    body: Json<FulfillerRequest>,
) -> Result<HttpResponse, EngineError> {
    let job = engine
        .begin_work(&path.into_inner(), &body.fulfiller_id)
        .await?;
    Ok(HttpResponse::Ok().json(JobResponse {
        message: "Work started".to_string(),
        job,
    }))
}

#[post("/{job_id}/complete")]
async fn complete_job(
    engine: Data<LifecycleEngine>,
    path: Path<String>,
    body: Json<FulfillerRequest>,
) -> Result<HttpResponse, EngineError> {
    let (job, breakdown) = engine
        .complete(&path.into_inner(), &body.fulfiller_id)
        .await?;
    Ok(HttpResponse::Ok().json(CompletionResponse {
        message: "Job completed and settled".to_string(),
        job,
        payout: breakdown,
    }))
}

#[post("/{job_id}/cancel")]
async fn cancel_job(
    engine: Data<LifecycleEngine>,
    path: Path<String>,
    body: Json<CancelRequest>,
) -> Result<HttpResponse, EngineError> {
    let job = engine
        .cancel(&path.into_inner(), &body.acting_party, &body.reason)
        .await?;
    Ok(HttpResponse::Ok().json(JobResponse {
        message: "Job cancelled".to_string(),
        job,
    }))
}

pub fn job_config(config: &mut ServiceConfig) {
    config.service(
        scope("jobs")
            .service(create_job)
            .service(get_job)
            .service(job_payout)
            .service(accept_job)
            .service(decline_job)
            .service(start_travel)
            .service(report_delay)
            .service(begin_work)
            .service(complete_job)
            .service(cancel_job),
    );
}
