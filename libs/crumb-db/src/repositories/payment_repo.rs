use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::payment::{
    MethodCount, MonthlyRevenue, Payment, PaymentMethod, PaymentStatus, PaymentTotals,
    new_transaction_id,
};
use crate::models::plan::UserSubscription;
use crate::repositories::Page;

const PAYMENT_SELECT: &str = r#"
    SELECT pm.*, p.name AS plan_name, u.email AS user_email
    FROM payments pm
    JOIN subscription_plans p ON p.id = pm.plan_id
    JOIN users u ON u.id = pm.user_id
"#;

#[derive(Debug, Clone)]
pub struct PaymentRepository {
    pool: PgPool,
}

impl PaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        amount_cents: i64,
        method: PaymentMethod,
        metadata: &serde_json::Value,
    ) -> Result<Payment> {
        sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (user_id, plan_id, amount_cents, status, method, transaction_id, metadata)
            VALUES ($1, $2, $3, 'pending', $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .bind(amount_cents)
        .bind(method.as_str())
        .bind(new_transaction_id())
        .bind(metadata)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create payment")
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Payment>> {
        let sql = format!("{PAYMENT_SELECT} WHERE pm.id = $1");
        sqlx::query_as::<_, Payment>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch payment by ID")
    }

    pub async fn get_for_user(&self, id: Uuid, user_id: Uuid) -> Result<Option<Payment>> {
        let sql = format!("{PAYMENT_SELECT} WHERE pm.id = $1 AND pm.user_id = $2");
        sqlx::query_as::<_, Payment>(&sql)
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user payment")
    }

    pub async fn list_for_user(&self, user_id: Uuid, page: Page) -> Result<Vec<Payment>> {
        let sql = format!(
            "{PAYMENT_SELECT} WHERE pm.user_id = $1 ORDER BY pm.created_at DESC LIMIT $2 OFFSET $3"
        );
        sqlx::query_as::<_, Payment>(&sql)
            .bind(user_id)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch user payments")
    }

    pub async fn list_all(
        &self,
        status: Option<PaymentStatus>,
        method: Option<PaymentMethod>,
        page: Page,
    ) -> Result<Vec<Payment>> {
        let sql = format!(
            r#"{PAYMENT_SELECT}
            WHERE ($1::text IS NULL OR pm.status = $1)
              AND ($2::text IS NULL OR pm.method = $2)
            ORDER BY pm.created_at DESC
            LIMIT $3 OFFSET $4"#
        );
        sqlx::query_as::<_, Payment>(&sql)
            .bind(status.map(|s| s.as_str()))
            .bind(method.map(|m| m.as_str()))
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list payments")
    }

    /// Settles a pending payment as successful and opens the subscription it
    /// paid for. Returns `None` if the payment is not the user's or is no
    /// longer pending; nothing is written in that case.
    pub async fn complete(
        &self,
        payment_id: Uuid,
        user_id: Uuid,
        duration_days: i32,
        selected_services: &[Uuid],
        metadata_patch: &serde_json::Value,
    ) -> Result<Option<(Payment, UserSubscription)>> {
        let mut tx = self.pool.begin().await?;

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = 'success', metadata = metadata || $3::jsonb, updated_at = NOW()
            WHERE id = $1 AND user_id = $2 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(payment_id)
        .bind(user_id)
        .bind(metadata_patch)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to mark payment successful")?;

        let Some(payment) = payment else {
            return Ok(None);
        };

        let subscription = sqlx::query_as::<_, UserSubscription>(
            r#"
            INSERT INTO user_subscriptions (user_id, plan_id, payment_id, is_active, purchased_at, expires_at)
            VALUES ($1, $2, $3, TRUE, NOW(), NOW() + make_interval(days => $4))
            RETURNING *
            "#,
        )
        .bind(payment.user_id)
        .bind(payment.plan_id)
        .bind(payment.id)
        .bind(duration_days)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to create subscription")?;

        if !selected_services.is_empty() {
            sqlx::query(
                "INSERT INTO subscription_selected_services (subscription_id, service_id) SELECT $1, UNNEST($2::uuid[]) ON CONFLICT DO NOTHING",
            )
            .bind(subscription.id)
            .bind(selected_services)
            .execute(&mut *tx)
            .await
            .context("Failed to store selected services")?;
        }

        tx.commit().await?;
        Ok(Some((payment, subscription)))
    }

    /// Marks the user's pending payment failed. `None` if it was not pending.
    pub async fn fail(
        &self,
        payment_id: Uuid,
        user_id: Uuid,
        metadata_patch: &serde_json::Value,
    ) -> Result<Option<Payment>> {
        sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = 'failed', metadata = metadata || $3::jsonb, updated_at = NOW()
            WHERE id = $1 AND user_id = $2 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(payment_id)
        .bind(user_id)
        .bind(metadata_patch)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to mark payment failed")
    }

    /// Refunds a successful payment and deactivates the subscription it opened.
    pub async fn refund(
        &self,
        payment_id: Uuid,
        metadata_patch: &serde_json::Value,
    ) -> Result<Option<(Payment, Option<UserSubscription>)>> {
        let mut tx = self.pool.begin().await?;

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = 'refunded', metadata = metadata || $2::jsonb, updated_at = NOW()
            WHERE id = $1 AND status = 'success'
            RETURNING *
            "#,
        )
        .bind(payment_id)
        .bind(metadata_patch)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to mark payment refunded")?;

        let Some(payment) = payment else {
            return Ok(None);
        };

        let subscription = sqlx::query_as::<_, UserSubscription>(
            "UPDATE user_subscriptions SET is_active = FALSE WHERE payment_id = $1 RETURNING *",
        )
        .bind(payment.id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to deactivate refunded subscription")?;

        tx.commit().await?;
        Ok(Some((payment, subscription)))
    }

    pub async fn totals(&self, user_id: Option<Uuid>) -> Result<PaymentTotals> {
        sqlx::query_as::<_, PaymentTotals>(
            r#"
            SELECT
                COUNT(*) AS total_payments,
                COUNT(*) FILTER (WHERE status = 'success') AS successful_payments,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed_payments,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending_payments,
                COUNT(*) FILTER (WHERE status = 'refunded') AS refunded_payments,
                COALESCE(SUM(amount_cents) FILTER (WHERE status = 'success'), 0)::BIGINT AS total_revenue_cents,
                COALESCE(SUM(COALESCE((metadata->>'refund_amount_cents')::BIGINT, amount_cents))
                    FILTER (WHERE status = 'refunded'), 0)::BIGINT AS refunded_amount_cents
            FROM payments
            WHERE ($1::uuid IS NULL OR user_id = $1)
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute payment totals")
    }

    pub async fn method_counts(&self) -> Result<Vec<MethodCount>> {
        sqlx::query_as::<_, MethodCount>(
            "SELECT method, COUNT(*) AS count FROM payments GROUP BY method ORDER BY count DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to count payments per method")
    }

    /// Successful revenue per calendar month, oldest first, covering `months` months.
    pub async fn monthly_revenue(&self, months: i32) -> Result<Vec<MonthlyRevenue>> {
        sqlx::query_as::<_, MonthlyRevenue>(
            r#"
            SELECT to_char(date_trunc('month', created_at), 'YYYY-MM') AS month,
                   COALESCE(SUM(amount_cents), 0)::BIGINT AS revenue_cents,
                   COUNT(*) AS payments
            FROM payments
            WHERE status = 'success'
              AND created_at >= date_trunc('month', NOW()) - make_interval(months => $1 - 1)
            GROUP BY 1
            ORDER BY 1
            "#,
        )
        .bind(months)
        .fetch_all(&self.pool)
        .await
        .context("Failed to compute monthly revenue")
    }
}
