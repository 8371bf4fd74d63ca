use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::cookie::{CookieInjectionLog, InjectionStatus, NewInjectionLog, StatusCount};
use crate::repositories::Page;

/// Audit trail of cookie hand-out attempts.
#[derive(Debug, Clone)]
pub struct InjectionLogRepository {
    pool: PgPool,
}

impl InjectionLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, entry: &NewInjectionLog) -> Result<CookieInjectionLog> {
        sqlx::query_as::<_, CookieInjectionLog>(
            r#"
            INSERT INTO cookie_injection_logs (cookie_id, user_id, service_id, status, message, ip_address, user_agent)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(entry.cookie_id)
        .bind(entry.user_id)
        .bind(entry.service_id)
        .bind(entry.status.as_str())
        .bind(&entry.message)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .fetch_one(&self.pool)
        .await
        .context("Failed to write injection log")
    }

    pub async fn list(
        &self,
        status: Option<InjectionStatus>,
        user_id: Option<Uuid>,
        page: Page,
    ) -> Result<Vec<CookieInjectionLog>> {
        sqlx::query_as::<_, CookieInjectionLog>(
            r#"
            SELECT * FROM cookie_injection_logs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::uuid IS NULL OR user_id = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(user_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list injection logs")
    }

    /// Counts per status, restricted to entries after `since` when given.
    pub async fn status_counts(&self, since: Option<DateTime<Utc>>) -> Result<Vec<StatusCount>> {
        sqlx::query_as::<_, StatusCount>(
            r#"
            SELECT status, COUNT(*) AS count FROM cookie_injection_logs
            WHERE ($1::timestamptz IS NULL OR created_at >= $1)
            GROUP BY status
            ORDER BY status
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("Failed to count injection logs per status")
    }

    pub async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cookie_injection_logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Failed to delete old injection logs")?;
        Ok(result.rows_affected())
    }
}
