use anyhow::Result;
use chrono::{Duration, Utc};
use crumb_db::models::cookie::StatusCount;
use crumb_db::repositories::cookie_repo::CookieRepository;
use crumb_db::repositories::extraction_job_repo::ExtractionJobRepository;
use crumb_db::repositories::injection_log_repo::InjectionLogRepository;
use crumb_db::repositories::login_service_repo::{LoginServiceRepository, PoolCapacity};
use crumb_db::repositories::user_service_repo::UserServiceRepository;
use serde::Serialize;
use sqlx::PgPool;

/// Aggregates for the cookie management dashboard.
#[derive(Clone)]
pub struct AnalyticsService {
    login_service_repo: LoginServiceRepository,
    user_service_repo: UserServiceRepository,
    cookie_repo: CookieRepository,
    log_repo: InjectionLogRepository,
    job_repo: ExtractionJobRepository,
}

#[derive(Debug, Serialize)]
pub struct PoolStats {
    #[serde(flatten)]
    pub capacity: PoolCapacity,
    pub utilization_percent: f64,
}

#[derive(Debug, Serialize)]
pub struct CookieManagementStats {
    pub login_services: PoolStats,
    pub user_services: Vec<StatusCount>,
    pub cookies: Vec<StatusCount>,
    pub injections: Vec<StatusCount>,
    pub injections_last_24h: Vec<StatusCount>,
    pub total_injections_last_24h: i64,
    pub extraction_jobs: Vec<StatusCount>,
}

impl AnalyticsService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            login_service_repo: LoginServiceRepository::new(pool.clone()),
            user_service_repo: UserServiceRepository::new(pool.clone()),
            cookie_repo: CookieRepository::new(pool.clone()),
            log_repo: InjectionLogRepository::new(pool.clone()),
            job_repo: ExtractionJobRepository::new(pool),
        }
    }

    pub async fn cookie_management_stats(&self) -> Result<CookieManagementStats> {
        let capacity = self.login_service_repo.capacity(None).await?;
        let recent = self
            .log_repo
            .status_counts(Some(Utc::now() - Duration::hours(24)))
            .await?;

        Ok(CookieManagementStats {
            login_services: PoolStats {
                utilization_percent: capacity.utilization_percent(),
                capacity,
            },
            user_services: self.user_service_repo.status_counts().await?,
            cookies: self.cookie_repo.status_counts().await?,
            injections: self.log_repo.status_counts(None).await?,
            total_injections_last_24h: recent.iter().map(|c| c.count).sum(),
            injections_last_24h: recent,
            extraction_jobs: self.job_repo.status_counts().await?,
        })
    }
}
