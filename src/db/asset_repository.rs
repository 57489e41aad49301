use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::collaborators::assets::{AssetCatalog, AssetError, AssetKind};

/// Postgres-backed record of onboarding-created resources, unique per
/// `(provider_id, kind)`. The upsert's no-op update arm makes RETURNING
/// yield the existing asset id on replays, which is the whole idempotency
/// story for resumable final-step completion.
pub struct AssetRepository {
    pool: Pool<Postgres>,
}

impl AssetRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AssetCatalog for AssetRepository {
    async fn ensure(&self, provider_id: &str, kind: AssetKind) -> Result<String, AssetError> {
        let candidate_id = Uuid::new_v4().to_string();
        let asset_id: String = sqlx::query_scalar(
            r#"
            INSERT INTO provider_assets (provider_id, kind, asset_id, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (provider_id, kind) DO UPDATE SET kind = EXCLUDED.kind
            RETURNING asset_id
            "#,
        )
        .bind(provider_id)
        .bind(kind.as_str())
        .bind(&candidate_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AssetError(e.to_string()))?;
        Ok(asset_id)
    }
}
