use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::models::access::{LoginService, LoginServiceInput, LoginServiceUpdate};

const LOGIN_SERVICE_SELECT: &str = r#"
    SELECT ls.*, s.display_name AS service_name
    FROM login_services ls
    JOIN services s ON s.id = ls.service_id
"#;

#[derive(Debug, Clone, Default, Serialize, FromRow)]
pub struct PoolCapacity {
    pub total_login_services: i64,
    pub active_login_services: i64,
    pub total_capacity: i64,
    pub used_capacity: i64,
}

impl PoolCapacity {
    pub fn utilization_percent(&self) -> f64 {
        if self.total_capacity == 0 {
            return 0.0;
        }
        (self.used_capacity as f64 / self.total_capacity as f64 * 10000.0).round() / 100.0
    }
}

#[derive(Debug, Clone)]
pub struct LoginServiceRepository {
    pool: PgPool,
}

impl LoginServiceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self, service_id: Option<Uuid>, active: Option<bool>) -> Result<Vec<LoginService>> {
        let sql = format!(
            r#"{LOGIN_SERVICE_SELECT}
            WHERE ($1::uuid IS NULL OR ls.service_id = $1)
              AND ($2::boolean IS NULL OR ls.is_active = $2)
            ORDER BY s.display_name ASC, ls.created_at ASC"#
        );
        sqlx::query_as::<_, LoginService>(&sql)
            .bind(service_id)
            .bind(active)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list login services")
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<LoginService>> {
        let sql = format!("{LOGIN_SERVICE_SELECT} WHERE ls.id = $1");
        sqlx::query_as::<_, LoginService>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch login service by ID")
    }

    pub async fn create(&self, input: &LoginServiceInput, encrypted_password: &str) -> Result<LoginService> {
        sqlx::query_as::<_, LoginService>(
            r#"
            INSERT INTO login_services
                (service_id, username, encrypted_password, additional_credentials, is_active, max_concurrent_users)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(input.service_id)
        .bind(&input.username)
        .bind(encrypted_password)
        .bind(&input.additional_credentials)
        .bind(input.is_active)
        .bind(input.max_concurrent_users)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create login service")
    }

    /// Applies the present fields. The capacity guard keeps `max_concurrent_users`
    /// at or above the slots currently held; `None` means not found or guarded.
    pub async fn update(
        &self,
        id: Uuid,
        update: &LoginServiceUpdate,
        encrypted_password: Option<&str>,
    ) -> Result<Option<LoginService>> {
        sqlx::query_as::<_, LoginService>(
            r#"
            UPDATE login_services
            SET username = COALESCE($2, username),
                encrypted_password = COALESCE($3, encrypted_password),
                additional_credentials = COALESCE($4, additional_credentials),
                is_active = COALESCE($5, is_active),
                max_concurrent_users = COALESCE($6, max_concurrent_users),
                updated_at = NOW()
            WHERE id = $1 AND COALESCE($6, max_concurrent_users) >= current_users
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(update.username.as_deref())
        .bind(encrypted_password)
        .bind(update.additional_credentials.as_ref())
        .bind(update.is_active)
        .bind(update.max_concurrent_users)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to update login service")
    }

    /// Deletes only an unused login service. Returns false when it holds slots
    /// or does not exist.
    pub async fn delete_unused(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM login_services WHERE id = $1 AND current_users = 0")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete login service")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn touch_login_attempt(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE login_services SET last_login_attempt = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to record login attempt")?;
        Ok(())
    }

    /// Resets `current_users` to the number of active assignments bound to
    /// each login service. Returns how many rows drifted.
    pub async fn reconcile_usage(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE login_services ls
            SET current_users = LEAST(counted.active, ls.max_concurrent_users), updated_at = NOW()
            FROM (
                SELECT l.id, COUNT(us.id)::INTEGER AS active
                FROM login_services l
                LEFT JOIN user_services us ON us.login_service_id = l.id AND us.status = 'active'
                GROUP BY l.id
            ) counted
            WHERE ls.id = counted.id AND ls.current_users <> LEAST(counted.active, ls.max_concurrent_users)
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to reconcile login service usage")?;
        Ok(result.rows_affected())
    }

    pub async fn capacity(&self, service_id: Option<Uuid>) -> Result<PoolCapacity> {
        sqlx::query_as::<_, PoolCapacity>(
            r#"
            SELECT
                COUNT(*) AS total_login_services,
                COUNT(*) FILTER (WHERE is_active = TRUE) AS active_login_services,
                COALESCE(SUM(max_concurrent_users) FILTER (WHERE is_active = TRUE), 0)::BIGINT AS total_capacity,
                COALESCE(SUM(current_users) FILTER (WHERE is_active = TRUE), 0)::BIGINT AS used_capacity
            FROM login_services
            WHERE ($1::uuid IS NULL OR service_id = $1)
            "#,
        )
        .bind(service_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute pool capacity")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utilization_handles_empty_pool() {
        assert_eq!(PoolCapacity::default().utilization_percent(), 0.0);
        let cap = PoolCapacity {
            total_capacity: 3,
            used_capacity: 1,
            ..Default::default()
        };
        assert_eq!(cap.utilization_percent(), 33.33);
    }
}
