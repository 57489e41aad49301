use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Optional source of a provider's current position, used to enrich
/// travel-start notifications. Strictly best-effort input: absence or
/// failure changes nothing about the transition.
#[async_trait]
pub trait GeoLocator: Send + Sync {
    async fn locate(&self, provider_id: &str) -> Option<GeoPoint>;
}

pub struct NoopGeoLocator;

#[async_trait]
impl GeoLocator for NoopGeoLocator {
    async fn locate(&self, _provider_id: &str) -> Option<GeoPoint> {
        None
    }
}
