use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::models::plan::UserSubscription;
use crate::repositories::Page;

const SUBSCRIPTION_SELECT: &str = r#"
    SELECT us.*, p.name AS plan_name, p.price_cents AS plan_price_cents, p.max_services
    FROM user_subscriptions us
    JOIN subscription_plans p ON p.id = us.plan_id
"#;

#[derive(Debug, Clone, Default, Serialize, FromRow)]
pub struct SubscriptionTotals {
    pub total_subscriptions: i64,
    pub active_subscriptions: i64,
    pub expired_subscriptions: i64,
    pub cancelled_subscriptions: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct PlanPopularity {
    pub plan_id: Uuid,
    pub plan_name: String,
    pub subscriptions: i64,
    pub active_subscriptions: i64,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRepository {
    pool: PgPool,
}

impl SubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<UserSubscription>> {
        let sql = format!("{SUBSCRIPTION_SELECT} WHERE us.id = $1");
        sqlx::query_as::<_, UserSubscription>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch subscription by ID")
    }

    pub async fn get_by_payment(&self, payment_id: Uuid) -> Result<Option<UserSubscription>> {
        let sql = format!("{SUBSCRIPTION_SELECT} WHERE us.payment_id = $1");
        sqlx::query_as::<_, UserSubscription>(&sql)
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch subscription by payment")
    }

    /// `current_only` keeps active, unexpired subscriptions.
    pub async fn list_for_user(&self, user_id: Uuid, current_only: bool) -> Result<Vec<UserSubscription>> {
        let sql = format!(
            r#"{SUBSCRIPTION_SELECT}
            WHERE us.user_id = $1
              AND ($2 = FALSE OR (us.is_active = TRUE AND us.expires_at > NOW()))
            ORDER BY us.purchased_at DESC"#
        );
        sqlx::query_as::<_, UserSubscription>(&sql)
            .bind(user_id)
            .bind(current_only)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch user subscriptions")
    }

    pub async fn list_all(&self, active: Option<bool>, page: Page) -> Result<Vec<UserSubscription>> {
        let sql = format!(
            r#"{SUBSCRIPTION_SELECT}
            WHERE ($1::boolean IS NULL OR us.is_active = $1)
            ORDER BY us.purchased_at DESC
            LIMIT $2 OFFSET $3"#
        );
        sqlx::query_as::<_, UserSubscription>(&sql)
            .bind(active)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list subscriptions")
    }

    pub async fn selected_services(&self, subscription_id: Uuid) -> Result<Vec<Uuid>> {
        sqlx::query_scalar(
            "SELECT service_id FROM subscription_selected_services WHERE subscription_id = $1",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch selected services")
    }

    /// Services the subscription currently grants: its selection, or the plan's list.
    pub async fn accessible_services_count(&self, subscription_id: Uuid) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT CASE
                WHEN EXISTS (SELECT 1 FROM subscription_selected_services WHERE subscription_id = us.id)
                THEN (SELECT COUNT(*) FROM subscription_selected_services WHERE subscription_id = us.id)
                ELSE (SELECT COUNT(*) FROM plan_services WHERE plan_id = us.plan_id)
            END
            FROM user_subscriptions us
            WHERE us.id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to count accessible services")
        .map(|c| c.unwrap_or(0))
    }

    pub async fn replace_selected_services(&self, subscription_id: Uuid, service_ids: &[Uuid]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM subscription_selected_services WHERE subscription_id = $1")
            .bind(subscription_id)
            .execute(&mut *tx)
            .await
            .context("Failed to clear selected services")?;

        sqlx::query(
            "INSERT INTO subscription_selected_services (subscription_id, service_id) SELECT $1, UNNEST($2::uuid[]) ON CONFLICT DO NOTHING",
        )
        .bind(subscription_id)
        .bind(service_ids)
        .execute(&mut *tx)
        .await
        .context("Failed to store selected services")?;

        tx.commit().await?;
        Ok(())
    }

    /// Returns false when the subscription was already inactive.
    pub async fn deactivate(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE user_subscriptions SET is_active = FALSE WHERE id = $1 AND is_active = TRUE")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to deactivate subscription")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn deactivate_lapsed(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE user_subscriptions SET is_active = FALSE WHERE is_active = TRUE AND expires_at <= NOW()",
        )
        .execute(&self.pool)
        .await
        .context("Failed to deactivate lapsed subscriptions")?;
        Ok(result.rows_affected())
    }

    /// How many pending/active assignments the user may hold.
    pub async fn service_allowance(&self, user_id: Uuid) -> Result<i64> {
        sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(p.max_services), 0)::BIGINT
            FROM user_subscriptions us
            JOIN subscription_plans p ON p.id = us.plan_id
            WHERE us.user_id = $1 AND us.is_active = TRUE AND us.expires_at > NOW()
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute service allowance")
    }

    pub async fn totals(&self, user_id: Option<Uuid>) -> Result<SubscriptionTotals> {
        sqlx::query_as::<_, SubscriptionTotals>(
            r#"
            SELECT
                COUNT(*) AS total_subscriptions,
                COUNT(*) FILTER (WHERE is_active = TRUE AND expires_at > NOW()) AS active_subscriptions,
                COUNT(*) FILTER (WHERE expires_at <= NOW()) AS expired_subscriptions,
                COUNT(*) FILTER (WHERE is_active = FALSE AND expires_at > NOW()) AS cancelled_subscriptions
            FROM user_subscriptions
            WHERE ($1::uuid IS NULL OR user_id = $1)
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute subscription totals")
    }

    pub async fn plan_popularity(&self) -> Result<Vec<PlanPopularity>> {
        sqlx::query_as::<_, PlanPopularity>(
            r#"
            SELECT p.id AS plan_id, p.name AS plan_name,
                   COUNT(us.id) AS subscriptions,
                   COUNT(us.id) FILTER (WHERE us.is_active = TRUE AND us.expires_at > NOW()) AS active_subscriptions
            FROM subscription_plans p
            LEFT JOIN user_subscriptions us ON us.plan_id = p.id
            GROUP BY p.id, p.name
            ORDER BY subscriptions DESC, p.name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to compute plan popularity")
    }

    /// Total spent by a user on successful (non-refunded) payments.
    pub async fn total_spent_cents(&self, user_id: Uuid) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount_cents), 0)::BIGINT FROM payments WHERE user_id = $1 AND status = 'success'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute total spent")
    }
}
