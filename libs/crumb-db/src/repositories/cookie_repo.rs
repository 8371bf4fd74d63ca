use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::cookie::{Cookie, CookieCheck, CookieStatus, StatusCount};
use crate::repositories::Page;

const COOKIE_SELECT: &str = r#"
    SELECT c.*, usv.service_id, usv.user_id
    FROM cookies c
    JOIN user_services usv ON usv.id = c.user_service_id
"#;

#[derive(Debug, Clone)]
pub struct CookieRepository {
    pool: PgPool,
}

impl CookieRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Stores the same extracted session for each assignment, pending validation.
    pub async fn create_for_assignments(
        &self,
        user_service_ids: &[Uuid],
        cookie_data: &serde_json::Value,
        session_id: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        sqlx::query_scalar(
            r#"
            INSERT INTO cookies (user_service_id, cookie_data, session_id, extracted_at, expires_at, status)
            SELECT UNNEST($1::uuid[]), $2, $3, NOW(), $4, 'pending_validation'
            RETURNING id
            "#,
        )
        .bind(user_service_ids)
        .bind(cookie_data)
        .bind(session_id)
        .bind(expires_at)
        .fetch_all(&self.pool)
        .await
        .context("Failed to store extracted cookies")
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Cookie>> {
        let sql = format!("{COOKIE_SELECT} WHERE c.id = $1");
        sqlx::query_as::<_, Cookie>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch cookie by ID")
    }

    pub async fn list(
        &self,
        status: Option<CookieStatus>,
        service_id: Option<Uuid>,
        page: Page,
    ) -> Result<Vec<Cookie>> {
        let sql = format!(
            r#"{COOKIE_SELECT}
            WHERE ($1::text IS NULL OR c.status = $1)
              AND ($2::uuid IS NULL OR usv.service_id = $2)
            ORDER BY c.extracted_at DESC
            LIMIT $3 OFFSET $4"#
        );
        sqlx::query_as::<_, Cookie>(&sql)
            .bind(status.map(|s| s.as_str()))
            .bind(service_id)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list cookies")
    }

    /// Newest cookie that may be handed out right now.
    pub async fn latest_servable(&self, user_service_id: Uuid) -> Result<Option<Cookie>> {
        let sql = format!(
            r#"{COOKIE_SELECT}
            WHERE c.user_service_id = $1 AND c.status = 'valid' AND c.expires_at > NOW()
            ORDER BY c.extracted_at DESC
            LIMIT 1"#
        );
        sqlx::query_as::<_, Cookie>(&sql)
            .bind(user_service_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch servable cookie")
    }

    pub async fn latest(&self, user_service_id: Uuid) -> Result<Option<Cookie>> {
        let sql = format!(
            "{COOKIE_SELECT} WHERE c.user_service_id = $1 ORDER BY c.extracted_at DESC LIMIT 1"
        );
        sqlx::query_as::<_, Cookie>(&sql)
            .bind(user_service_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch latest cookie")
    }

    pub async fn set_status(&self, id: Uuid, status: CookieStatus) -> Result<Option<Cookie>> {
        let updated: Option<Uuid> = sqlx::query_scalar(
            "UPDATE cookies SET status = $2 WHERE id = $1 RETURNING id",
        )
        .bind(id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to update cookie status")?;

        match updated {
            Some(id) => self.get_by_id(id).await,
            None => Ok(None),
        }
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cookies WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete cookie")?;
        Ok(result.rows_affected() > 0)
    }

    /// Non-terminal cookies to re-evaluate, limited to `ids` when given.
    pub async fn pending_checks(&self, ids: Option<&[Uuid]>) -> Result<Vec<CookieCheck>> {
        sqlx::query_as::<_, CookieCheck>(
            r#"
            SELECT c.id, c.status, c.expires_at, (usv.status = 'active') AS assignment_active
            FROM cookies c
            JOIN user_services usv ON usv.id = c.user_service_id
            WHERE c.status IN ('valid', 'pending_validation')
              AND ($1::uuid[] IS NULL OR c.id = ANY($1))
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load cookies for validation")
    }

    /// Records one validation attempt on each cookie and sets its new status.
    /// Cookies that turned terminal since they were read are left alone, and
    /// nothing is marked valid once its assignment is no longer active.
    pub async fn apply_validation(&self, ids: &[Uuid], status: CookieStatus) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE cookies c
            SET status = $2, last_validated = NOW(), validation_attempts = c.validation_attempts + 1
            WHERE c.id = ANY($1)
              AND c.status IN ('valid', 'pending_validation')
              AND (
                  $2 <> 'valid'
                  OR EXISTS (
                      SELECT 1 FROM user_services usv
                      WHERE usv.id = c.user_service_id AND usv.status = 'active'
                  )
              )
            "#,
        )
        .bind(ids)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to apply cookie validation")?;
        Ok(result.rows_affected())
    }

    pub async fn expire_lapsed(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE cookies SET status = 'expired' WHERE status IN ('valid', 'pending_validation') AND expires_at <= NOW()",
        )
        .execute(&self.pool)
        .await
        .context("Failed to expire lapsed cookies")?;
        Ok(result.rows_affected())
    }

    /// Removes expired/invalid cookies extracted before `cutoff`.
    pub async fn delete_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM cookies WHERE status IN ('expired', 'invalid') AND extracted_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to delete stale cookies")?;
        Ok(result.rows_affected())
    }

    pub async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        sqlx::query_as::<_, StatusCount>(
            "SELECT status, COUNT(*) AS count FROM cookies GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to count cookies per status")
    }

    pub async fn valid_count_for_service(&self, service_id: Uuid) -> Result<i64> {
        sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM cookies c
            JOIN user_services usv ON usv.id = c.user_service_id
            WHERE usv.service_id = $1 AND c.status = 'valid' AND c.expires_at > NOW()
            "#,
        )
        .bind(service_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count valid cookies for service")
    }
}
