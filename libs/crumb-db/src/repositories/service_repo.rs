use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::catalog::{CategoryCount, Service, ServiceCategory, ServiceInput};
use crate::repositories::{ENTITLEMENTS, Page};

#[derive(Debug, Clone)]
pub struct ServiceRepository {
    pool: PgPool,
}

impl ServiceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(
        &self,
        active_only: bool,
        category: Option<ServiceCategory>,
        page: Page,
    ) -> Result<Vec<Service>> {
        sqlx::query_as::<_, Service>(
            r#"
            SELECT * FROM services
            WHERE ($1 = FALSE OR is_active = TRUE)
              AND ($2::text IS NULL OR category = $2)
            ORDER BY display_name ASC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(active_only)
        .bind(category.map(|c| c.as_str()))
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list services")
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Service>> {
        sqlx::query_as::<_, Service>("SELECT * FROM services WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch service by ID")
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Service>> {
        sqlx::query_as::<_, Service>("SELECT * FROM services WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch service by name")
    }

    /// Subset of `ids` that exist and are active.
    pub async fn active_ids(&self, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        sqlx::query_scalar("SELECT id FROM services WHERE id = ANY($1) AND is_active = TRUE")
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .context("Failed to resolve active services")
    }

    /// Returns `None` when the name is already used.
    pub async fn create(&self, input: &ServiceInput) -> Result<Option<Service>> {
        sqlx::query_as::<_, Service>(
            r#"
            INSERT INTO services (name, display_name, login_url, description, logo_url, category, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&input.name)
        .bind(&input.display_name)
        .bind(&input.login_url)
        .bind(&input.description)
        .bind(&input.logo_url)
        .bind(input.category.as_str())
        .bind(input.is_active)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to create service")
    }

    pub async fn update(&self, id: Uuid, input: &ServiceInput) -> Result<Option<Service>> {
        sqlx::query_as::<_, Service>(
            r#"
            UPDATE services
            SET name = $2, display_name = $3, login_url = $4, description = $5,
                logo_url = $6, category = $7, is_active = $8
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&input.name)
        .bind(&input.display_name)
        .bind(&input.login_url)
        .bind(&input.description)
        .bind(&input.logo_url)
        .bind(input.category.as_str())
        .bind(input.is_active)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to update service")
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM services WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete service")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn category_counts(&self) -> Result<Vec<CategoryCount>> {
        sqlx::query_as::<_, CategoryCount>(
            r#"
            SELECT category, COUNT(*) AS service_count
            FROM services
            WHERE is_active = TRUE
            GROUP BY category
            ORDER BY category
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to count services per category")
    }

    /// Active services the user may request through a current subscription.
    pub async fn accessible_for_user(&self, user_id: Uuid) -> Result<Vec<Service>> {
        let sql = format!(
            r#"
            SELECT s.* FROM services s
            WHERE s.is_active = TRUE
              AND s.id IN (SELECT e.service_id FROM ({ENTITLEMENTS}) e WHERE e.user_id = $1)
            ORDER BY s.display_name ASC
            "#
        );
        sqlx::query_as::<_, Service>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch accessible services")
    }

    pub async fn is_entitled(&self, user_id: Uuid, service_id: Uuid) -> Result<bool> {
        let sql = format!(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM ({ENTITLEMENTS}) e
                JOIN services s ON s.id = e.service_id
                WHERE e.user_id = $1 AND e.service_id = $2 AND s.is_active = TRUE
            )
            "#
        );
        sqlx::query_scalar(&sql)
            .bind(user_id)
            .bind(service_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to check service entitlement")
    }

    pub async fn count(&self, active_only: bool) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM services WHERE ($1 = FALSE OR is_active = TRUE)")
            .bind(active_only)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count services")
    }
}
