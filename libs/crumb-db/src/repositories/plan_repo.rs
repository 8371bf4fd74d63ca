use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::catalog::Service;
use crate::models::plan::{PlanInput, SubscriptionPlan};

const PLAN_COLUMNS: &str = r#"
    p.*,
    (SELECT COUNT(*) FROM plan_services ps JOIN services s ON s.id = ps.service_id
     WHERE ps.plan_id = p.id AND s.is_active = TRUE) AS service_count
"#;

#[derive(Debug, Clone)]
pub struct PlanRepository {
    pool: PgPool,
}

impl PlanRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self, active_only: bool) -> Result<Vec<SubscriptionPlan>> {
        let sql = format!(
            "SELECT {PLAN_COLUMNS} FROM subscription_plans p WHERE ($1 = FALSE OR p.is_active = TRUE) ORDER BY p.price_cents ASC, p.name ASC"
        );
        sqlx::query_as::<_, SubscriptionPlan>(&sql)
            .bind(active_only)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list plans")
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<SubscriptionPlan>> {
        let sql = format!("SELECT {PLAN_COLUMNS} FROM subscription_plans p WHERE p.id = $1");
        sqlx::query_as::<_, SubscriptionPlan>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch plan by ID")
    }

    pub async fn service_ids(&self, plan_id: Uuid) -> Result<Vec<Uuid>> {
        sqlx::query_scalar("SELECT service_id FROM plan_services WHERE plan_id = $1")
            .bind(plan_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch plan service IDs")
    }

    pub async fn services(&self, plan_id: Uuid) -> Result<Vec<Service>> {
        sqlx::query_as::<_, Service>(
            r#"
            SELECT s.* FROM services s
            JOIN plan_services ps ON ps.service_id = s.id
            WHERE ps.plan_id = $1
            ORDER BY s.display_name ASC
            "#,
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch plan services")
    }

    /// Active, unexpired subscriptions on this plan.
    pub async fn subscriber_count(&self, plan_id: Uuid) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM user_subscriptions WHERE plan_id = $1 AND is_active = TRUE AND expires_at > NOW()",
        )
        .bind(plan_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count plan subscribers")
    }

    pub async fn create(&self, input: &PlanInput) -> Result<SubscriptionPlan> {
        let mut tx = self.pool.begin().await?;

        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO subscription_plans (name, description, price_cents, duration_days, max_services, is_active)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.price_cents)
        .bind(input.duration_days)
        .bind(input.max_services)
        .bind(input.is_active)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to create plan")?;

        Self::replace_services(&mut tx, id, &input.service_ids).await?;
        tx.commit().await?;

        self.get_by_id(id)
            .await?
            .context("Plan vanished after insert")
    }

    pub async fn update(&self, id: Uuid, input: &PlanInput) -> Result<Option<SubscriptionPlan>> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE subscription_plans
            SET name = $2, description = $3, price_cents = $4, duration_days = $5,
                max_services = $6, is_active = $7
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.price_cents)
        .bind(input.duration_days)
        .bind(input.max_services)
        .bind(input.is_active)
        .execute(&mut *tx)
        .await
        .context("Failed to update plan")?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }

        Self::replace_services(&mut tx, id, &input.service_ids).await?;
        tx.commit().await?;

        self.get_by_id(id).await
    }

    async fn replace_services(
        tx: &mut Transaction<'_, Postgres>,
        plan_id: Uuid,
        service_ids: &[Uuid],
    ) -> Result<()> {
        sqlx::query("DELETE FROM plan_services WHERE plan_id = $1")
            .bind(plan_id)
            .execute(&mut **tx)
            .await
            .context("Failed to clear plan services")?;

        sqlx::query(
            "INSERT INTO plan_services (plan_id, service_id) SELECT $1, UNNEST($2::uuid[]) ON CONFLICT DO NOTHING",
        )
        .bind(plan_id)
        .bind(service_ids)
        .execute(&mut **tx)
        .await
        .context("Failed to attach plan services")?;
        Ok(())
    }

    /// Subscriptions and payments referencing the plan; either blocks deletion.
    pub async fn usage_count(&self, plan_id: Uuid) -> Result<i64> {
        sqlx::query_scalar(
            r#"
            SELECT (SELECT COUNT(*) FROM user_subscriptions WHERE plan_id = $1)
                 + (SELECT COUNT(*) FROM payments WHERE plan_id = $1)
            "#,
        )
        .bind(plan_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count plan usage")
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM subscription_plans WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete plan")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn deactivate(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE subscription_plans SET is_active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to deactivate plan")?;
        Ok(result.rows_affected() > 0)
    }
}
