use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use tracing::debug;

use crate::collaborators::storage::{OnboardingStore, StoreError};
use crate::db::models::OnboardingRow;
use crate::domain::{OnboardingPlan, OnboardingState};

const ONBOARDING_COLUMNS: &str = "provider_id, current_step, total_steps, service_defined_at, \
     live_at, is_complete, activated, verified_since, stage_label, updated_at";

/// Repository for provider onboarding rows. Monotonicity (`advance` only
/// up, `rewind` only down) is pushed into the SQL so concurrent sessions
/// of the same provider converge without a read-modify-write window.
pub struct OnboardingRepository {
    pool: Pool<Postgres>,
}

impl OnboardingRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn map_sqlx(err: sqlx::Error) -> StoreError {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            other => StoreError::Unavailable(other.to_string()),
        }
    }

    async fn fetch(&self, provider_id: &str) -> Result<Option<OnboardingRow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM provider_onboarding WHERE provider_id = $1",
            ONBOARDING_COLUMNS
        );
        sqlx::query_as::<_, OnboardingRow>(&sql)
            .bind(provider_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::map_sqlx)
    }
}

#[async_trait]
impl OnboardingStore for OnboardingRepository {
    async fn get(&self, provider_id: &str) -> Result<Option<OnboardingState>, StoreError> {
        Ok(self.fetch(provider_id).await?.map(OnboardingRow::into_state))
    }

    async fn advance(
        &self,
        provider_id: &str,
        to_step: i32,
        plan: &OnboardingPlan,
    ) -> Result<OnboardingState, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO provider_onboarding
                (provider_id, current_step, total_steps, service_defined_at, live_at,
                 is_complete, activated, verified_since, stage_label, updated_at)
            VALUES ($1, $2, $3, $4, $5, FALSE, FALSE, NULL, 'applicant', NOW())
            ON CONFLICT (provider_id) DO UPDATE SET
                current_step = GREATEST(provider_onboarding.current_step, EXCLUDED.current_step),
                updated_at = NOW()
            RETURNING {}
            "#,
            ONBOARDING_COLUMNS
        );
        let row = sqlx::query_as::<_, OnboardingRow>(&sql)
            .bind(provider_id)
            .bind(to_step)
            .bind(plan.total_steps)
            .bind(plan.thresholds.service_defined)
            .bind(plan.thresholds.live)
            .fetch_one(&self.pool)
            .await
            .map_err(Self::map_sqlx)?;
        debug!(provider_id, step = row.current_step, "onboarding step persisted");
        Ok(row.into_state())
    }

    async fn rewind(&self, provider_id: &str, to_step: i32) -> Result<OnboardingState, StoreError> {
        let sql = format!(
            r#"
            UPDATE provider_onboarding
            SET current_step = LEAST(current_step, $2), updated_at = NOW()
            WHERE provider_id = $1 AND NOT is_complete
            RETURNING {}
            "#,
            ONBOARDING_COLUMNS
        );
        let row = sqlx::query_as::<_, OnboardingRow>(&sql)
            .bind(provider_id)
            .bind(to_step)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::map_sqlx)?;
        match row {
            Some(row) => Ok(row.into_state()),
            None => match self.fetch(provider_id).await? {
                None => Err(StoreError::NotFound),
                Some(_) => Err(StoreError::Refused(
                    "state is complete and read-only".to_string(),
                )),
            },
        }
    }

    async fn mark_complete(
        &self,
        provider_id: &str,
        verified_since: DateTime<Utc>,
    ) -> Result<OnboardingState, StoreError> {
        // COALESCE keeps the original verification timestamp on re-runs.
        let sql = format!(
            r#"
            UPDATE provider_onboarding
            SET is_complete = TRUE,
                verified_since = COALESCE(verified_since, $2),
                updated_at = NOW()
            WHERE provider_id = $1 AND current_step = total_steps
            RETURNING {}
            "#,
            ONBOARDING_COLUMNS
        );
        let row = sqlx::query_as::<_, OnboardingRow>(&sql)
            .bind(provider_id)
            .bind(verified_since)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::map_sqlx)?;
        match row {
            Some(row) => Ok(row.into_state()),
            None => match self.fetch(provider_id).await? {
                None => Err(StoreError::NotFound),
                Some(_) => Err(StoreError::Refused("not at the final step".to_string())),
            },
        }
    }

    async fn mark_activated(&self, provider_id: &str) -> Result<OnboardingState, StoreError> {
        let sql = format!(
            r#"
            UPDATE provider_onboarding
            SET activated = TRUE, updated_at = NOW()
            WHERE provider_id = $1 AND is_complete
            RETURNING {}
            "#,
            ONBOARDING_COLUMNS
        );
        let row = sqlx::query_as::<_, OnboardingRow>(&sql)
            .bind(provider_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::map_sqlx)?;
        match row {
            Some(row) => Ok(row.into_state()),
            None => match self.fetch(provider_id).await? {
                None => Err(StoreError::NotFound),
                Some(_) => Err(StoreError::Refused("not complete".to_string())),
            },
        }
    }

    async fn refresh_stage_cache(&self, provider_id: &str, label: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE provider_onboarding SET stage_label = $2 WHERE provider_id = $1")
            .bind(provider_id)
            .bind(label)
            .execute(&self.pool)
            .await
            .map_err(Self::map_sqlx)?;
        Ok(())
    }
}
