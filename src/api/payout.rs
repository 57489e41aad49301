use actix_web::{
    HttpResponse, post,
    web::{Data, ServiceConfig, scope},
};
use actix_web_validator::Json;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::config::Config;
use crate::engine::EngineError;
use crate::payout;

#[derive(Debug, Deserialize, Validate)]
pub struct QuoteRequest {
    #[validate(range(min = 1, message = "Gross price must be a positive amount in minor units"))]
    pub gross_price_minor: i64,
    #[validate(range(min = 1, max = 1440, message = "Duration must be between 1 and 1440 minutes"))]
    pub duration_minutes: i64,
    #[validate(range(min = 0.0, max = 0.99, message = "Fee rate must be below 1.0"))]
    pub fee_rate_percent: Option<f64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PriceFromNetRequest {
    #[validate(range(min = 1, message = "Net payout must be a positive amount in minor units"))]
    pub net_payout_minor: i64,
    #[validate(range(min = 0.0, max = 0.99, message = "Fee rate must be below 1.0"))]
    pub fee_rate_percent: Option<f64>,
}

#[derive(Serialize)]
pub struct PriceFromNetResponse {
    pub gross_price_minor: i64,
    pub net_payout_minor: i64,
    pub fee_rate_bp: i64,
}

/// Forward quote: what a job at this price and duration earns.
#[post("/quote")]
async fn quote(
    config: Data<Config>,
    body: Json<QuoteRequest>,
) -> Result<HttpResponse, EngineError> {
    let fee_rate_bp = body
        .fee_rate_percent
        .map(payout::fee_rate_bp_from_fraction)
        .unwrap_or(config.default_fee_rate_bp);
    let breakdown =
        payout::compute_payout(body.gross_price_minor, body.duration_minutes, fee_rate_bp)?;
    Ok(HttpResponse::Ok().json(breakdown))
}

/// Inverse direction: the gross price to charge for a desired take-home
/// amount, used when providers price packages by net payout.
#[post("/price")]
async fn price_from_net(
    config: Data<Config>,
    body: Json<PriceFromNetRequest>,
) -> Result<HttpResponse, EngineError> {
    let fee_rate_bp = body
        .fee_rate_percent
        .map(payout::fee_rate_bp_from_fraction)
        .unwrap_or(config.default_fee_rate_bp);
    let gross_price_minor = payout::gross_from_net(body.net_payout_minor, fee_rate_bp)?;
    Ok(HttpResponse::Ok().json(PriceFromNetResponse {
        gross_price_minor,
        net_payout_minor: body.net_payout_minor,
        fee_rate_bp,
    }))
}

pub fn payout_config(config: &mut ServiceConfig) {
    config.service(scope("payout").service(quote).service(price_from_net));
}
