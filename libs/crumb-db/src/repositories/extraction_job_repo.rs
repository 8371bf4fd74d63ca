use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::cookie::{CookieExtractionJob, JobStatus, StatusCount};
use crate::repositories::Page;

#[derive(Debug, Clone)]
pub struct ExtractionJobRepository {
    pool: PgPool,
}

impl ExtractionJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, login_service_id: Uuid) -> Result<CookieExtractionJob> {
        sqlx::query_as::<_, CookieExtractionJob>(
            "INSERT INTO cookie_extraction_jobs (login_service_id, status) VALUES ($1, 'pending') RETURNING *",
        )
        .bind(login_service_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create extraction job")
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<CookieExtractionJob>> {
        sqlx::query_as::<_, CookieExtractionJob>("SELECT * FROM cookie_extraction_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch extraction job by ID")
    }

    pub async fn list(
        &self,
        status: Option<JobStatus>,
        login_service_id: Option<Uuid>,
        page: Page,
    ) -> Result<Vec<CookieExtractionJob>> {
        sqlx::query_as::<_, CookieExtractionJob>(
            r#"
            SELECT * FROM cookie_extraction_jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::uuid IS NULL OR login_service_id = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(login_service_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list extraction jobs")
    }

    /// pending -> in_progress. `None` when the job was cancelled or already picked up.
    pub async fn start(&self, id: Uuid) -> Result<Option<CookieExtractionJob>> {
        sqlx::query_as::<_, CookieExtractionJob>(
            r#"
            UPDATE cookie_extraction_jobs
            SET status = 'in_progress', started_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to start extraction job")
    }

    pub async fn complete(&self, id: Uuid, extracted: i32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cookie_extraction_jobs
            SET status = 'completed', completed_at = NOW(), extracted_cookies_count = $2
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(id)
        .bind(extracted)
        .execute(&self.pool)
        .await
        .context("Failed to complete extraction job")?;
        Ok(())
    }

    pub async fn fail(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cookie_extraction_jobs
            SET status = 'failed', completed_at = NOW(), error_message = $2
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to record extraction failure")?;
        Ok(())
    }

    /// pending -> cancelled. `None` when the job is no longer pending.
    pub async fn cancel(&self, id: Uuid) -> Result<Option<CookieExtractionJob>> {
        sqlx::query_as::<_, CookieExtractionJob>(
            r#"
            UPDATE cookie_extraction_jobs
            SET status = 'cancelled', completed_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to cancel extraction job")
    }

    pub async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        sqlx::query_as::<_, StatusCount>(
            "SELECT status, COUNT(*) AS count FROM cookie_extraction_jobs GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to count extraction jobs per status")
    }
}
