use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use crumb_db::models::cookie::{CookieExtractionJob, JobStatus};
use crumb_db::repositories::Page;
use crumb_db::repositories::cookie_repo::CookieRepository;
use crumb_db::repositories::extraction_job_repo::ExtractionJobRepository;
use crumb_db::repositories::service_repo::ServiceRepository;
use sqlx::PgPool;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::services::access_service::AccessService;
use crate::services::cookie_service::CookieService;
use crate::services::extraction::{CookieExtractor, LoginRequest};

/// Runs extraction jobs: log in with a pooled credential set and hand the
/// captured session to every active assignment on it.
#[derive(Clone)]
pub struct ExtractionService {
    job_repo: ExtractionJobRepository,
    cookie_repo: CookieRepository,
    service_repo: ServiceRepository,
    access: Arc<AccessService>,
    cookies: Arc<CookieService>,
    extractor: Arc<dyn CookieExtractor>,
    cookie_ttl: chrono::Duration,
}

impl ExtractionService {
    pub fn new(
        pool: PgPool,
        access: Arc<AccessService>,
        cookies: Arc<CookieService>,
        extractor: Arc<dyn CookieExtractor>,
        cookie_ttl: chrono::Duration,
    ) -> Self {
        Self {
            job_repo: ExtractionJobRepository::new(pool.clone()),
            cookie_repo: CookieRepository::new(pool.clone()),
            service_repo: ServiceRepository::new(pool),
            access,
            cookies,
            extractor,
            cookie_ttl,
        }
    }

    /// Queues a job and runs it in the background.
    pub async fn start_job(&self, login_service_id: Uuid) -> AppResult<CookieExtractionJob> {
        let login_service = self.access.login_service(login_service_id).await?;
        if !login_service.is_active {
            return Err(AppError::bad_request("Login service is inactive."));
        }

        let job = self.job_repo.create(login_service_id).await?;
        info!(job_id = %job.id, login_service_id = %login_service_id, extractor = self.extractor.name(), "Queued cookie extraction");

        let this = self.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            this.run(job_id).await;
        });

        Ok(job)
    }

    /// Moves a pending job through its lifecycle. Jobs cancelled before the
    /// worker picks them up are left alone.
    pub async fn run(&self, job_id: Uuid) {
        let job = match self.job_repo.start(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job_id = %job_id, "Extraction job is no longer pending");
                return;
            }
            Err(e) => {
                error!("Failed to start extraction job {}: {:#}", job_id, e);
                return;
            }
        };

        let outcome = match self.execute(&job).await {
            Ok(stored) => {
                info!(job_id = %job_id, stored, "Cookie extraction completed");
                self.job_repo.complete(job_id, stored).await
            }
            Err(e) => {
                warn!(job_id = %job_id, "Cookie extraction failed: {:#}", e);
                self.job_repo.fail(job_id, &format!("{:#}", e)).await
            }
        };
        if let Err(e) = outcome {
            error!("Failed to record result of extraction job {}: {:#}", job_id, e);
        }
    }

    async fn execute(&self, job: &CookieExtractionJob) -> anyhow::Result<i32> {
        let login_service = self.access.login_service(job.login_service_id).await?;
        if !login_service.is_active {
            bail!("Login service is inactive");
        }
        let service = self
            .service_repo
            .get_by_id(login_service.service_id)
            .await?
            .context("Service of the login service no longer exists")?;
        let password = self.access.reveal_password(&login_service)?;

        self.access.touch_login_attempt(login_service.id).await?;
        let session = self
            .extractor
            .extract(&LoginRequest {
                login_url: &service.login_url,
                username: &login_service.username,
                password: &password,
                options: &login_service.additional_credentials,
            })
            .await?;

        let assignments: Vec<Uuid> = self
            .access
            .active_on_login_service(login_service.id)
            .await?
            .into_iter()
            .map(|a| a.id)
            .collect();
        if assignments.is_empty() {
            debug!(login_service_id = %login_service.id, "No active assignments to receive cookies");
            return Ok(0);
        }

        let expires_at = session.resolved_expiry(Utc::now(), self.cookie_ttl);
        let session_id = session.resolved_session_id();
        let ids = self
            .cookie_repo
            .create_for_assignments(
                &assignments,
                &serde_json::Value::Object(session.cookies),
                Some(&session_id),
                expires_at,
            )
            .await?;

        self.cookies.validate(Some(&ids)).await?;
        Ok(i32::try_from(ids.len()).unwrap_or(i32::MAX))
    }

    pub async fn cancel(&self, job_id: Uuid) -> AppResult<CookieExtractionJob> {
        let job = self.get(job_id).await?;
        if !job.status.can_cancel() {
            return Err(AppError::bad_request(format!(
                "Only pending jobs can be cancelled; this job is {}.",
                job.status
            )));
        }
        let cancelled = self
            .job_repo
            .cancel(job_id)
            .await?
            .ok_or_else(|| AppError::bad_request("Job started before it could be cancelled."))?;
        info!(job_id = %job_id, "Cancelled extraction job");
        Ok(cancelled)
    }

    pub async fn get(&self, job_id: Uuid) -> AppResult<CookieExtractionJob> {
        self.job_repo
            .get_by_id(job_id)
            .await?
            .ok_or_else(|| AppError::not_found("Extraction job not found."))
    }

    pub async fn list(
        &self,
        status: Option<JobStatus>,
        login_service_id: Option<Uuid>,
        page: Page,
    ) -> AppResult<Vec<CookieExtractionJob>> {
        Ok(self.job_repo.list(status, login_service_id, page).await?)
    }
}
