use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use crumb_db::models::cookie::ValidationSummary;
use crumb_db::repositories::cookie_repo::CookieRepository;
use crumb_db::repositories::injection_log_repo::InjectionLogRepository;
use crumb_db::repositories::login_service_repo::LoginServiceRepository;
use crumb_db::repositories::subscription_repo::SubscriptionRepository;
use crumb_db::repositories::user_service_repo::UserServiceRepository;
use serde::Serialize;
use sqlx::PgPool;
use tokio::time::interval;
use tracing::{error, info};

use crate::error::{AppError, AppResult};
use crate::services::cookie_service::CookieService;
use crate::services::user_service::UserService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub cookie_days: i64,
    pub log_days: i64,
}

impl Retention {
    pub const MAX_DAYS: i64 = 3650;

    /// Applies defaults to optional overrides; both windows must lie within
    /// one day and `MAX_DAYS`.
    pub fn resolve(cookie_days: Option<i64>, log_days: Option<i64>, defaults: Retention) -> AppResult<Self> {
        let retention = Retention {
            cookie_days: cookie_days.unwrap_or(defaults.cookie_days),
            log_days: log_days.unwrap_or(defaults.log_days),
        };
        let range = 1..=Self::MAX_DAYS;
        if !range.contains(&retention.cookie_days) || !range.contains(&retention.log_days) {
            return Err(AppError::bad_request(format!(
                "Retention periods must be between 1 and {} days.",
                Self::MAX_DAYS
            )));
        }
        Ok(retention)
    }
}

fn cutoff(now: DateTime<Utc>, days: i64) -> anyhow::Result<DateTime<Utc>> {
    TimeDelta::try_days(days)
        .and_then(|window| now.checked_sub_signed(window))
        .with_context(|| format!("Retention of {days} days is out of range"))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupSummary {
    pub subscriptions_deactivated: u64,
    pub assignments_released: u64,
    pub cookies_expired: u64,
    pub cookies_deleted: u64,
    pub logs_deleted: u64,
    pub login_services_reconciled: u64,
    pub tokens_purged: u64,
}

/// Periodic upkeep: cookie validation, retention and slot reconciliation.
#[derive(Clone)]
pub struct MonitoringService {
    subscription_repo: SubscriptionRepository,
    user_service_repo: UserServiceRepository,
    login_service_repo: LoginServiceRepository,
    cookie_repo: CookieRepository,
    log_repo: InjectionLogRepository,
    cookies: Arc<CookieService>,
    users: Arc<UserService>,
    defaults: Retention,
    every: std::time::Duration,
}

impl MonitoringService {
    pub fn new(
        pool: PgPool,
        cookies: Arc<CookieService>,
        users: Arc<UserService>,
        defaults: Retention,
        every: std::time::Duration,
    ) -> Self {
        Self {
            subscription_repo: SubscriptionRepository::new(pool.clone()),
            user_service_repo: UserServiceRepository::new(pool.clone()),
            login_service_repo: LoginServiceRepository::new(pool.clone()),
            cookie_repo: CookieRepository::new(pool.clone()),
            log_repo: InjectionLogRepository::new(pool),
            cookies,
            users,
            defaults,
            every,
        }
    }

    pub fn default_retention(&self) -> Retention {
        self.defaults
    }

    pub async fn start(&self) {
        info!("Starting background maintenance every {:?}", self.every);
        let mut ticker = interval(self.every);
        // The first tick fires immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = self.run_pass().await {
                error!("Maintenance error: {:#}", e);
            }
        }
    }

    /// One validation pass followed by cleanup with the default retention.
    pub async fn run_pass(&self) -> AppResult<(ValidationSummary, CleanupSummary)> {
        let validation = self.cookies.validate(None).await?;
        let cleanup = self.cleanup(self.defaults).await?;
        Ok((validation, cleanup))
    }

    pub async fn cleanup(&self, retention: Retention) -> anyhow::Result<CleanupSummary> {
        let now = Utc::now();
        let mut summary = CleanupSummary {
            subscriptions_deactivated: self.subscription_repo.deactivate_lapsed().await?,
            ..Default::default()
        };
        summary.assignments_released = self.user_service_repo.release_unentitled(None).await?;
        summary.cookies_expired = self.cookie_repo.expire_lapsed().await?;
        summary.cookies_deleted = self
            .cookie_repo
            .delete_stale(cutoff(now, retention.cookie_days)?)
            .await?;
        summary.logs_deleted = self
            .log_repo
            .delete_before(cutoff(now, retention.log_days)?)
            .await?;
        summary.login_services_reconciled = self.login_service_repo.reconcile_usage().await?;
        summary.tokens_purged = self.users.purge_revoked_tokens().await?;

        if summary.subscriptions_deactivated + summary.assignments_released + summary.cookies_deleted > 0 {
            info!(
                subscriptions = summary.subscriptions_deactivated,
                released = summary.assignments_released,
                cookies_deleted = summary.cookies_deleted,
                logs_deleted = summary.logs_deleted,
                "Cleanup pass finished"
            );
        }
        if summary.login_services_reconciled > 0 {
            info!("Reconciled usage on {} login services", summary.login_services_reconciled);
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULTS: Retention = Retention {
        cookie_days: 7,
        log_days: 90,
    };

    #[test]
    fn retention_falls_back_to_defaults() {
        assert_eq!(Retention::resolve(None, None, DEFAULTS).unwrap(), DEFAULTS);
        let custom = Retention::resolve(Some(1), None, DEFAULTS).unwrap();
        assert_eq!(custom.cookie_days, 1);
        assert_eq!(custom.log_days, 90);
    }

    #[test]
    fn retention_rejects_non_positive_windows() {
        assert!(Retention::resolve(Some(0), None, DEFAULTS).is_err());
        assert!(Retention::resolve(None, Some(-3), DEFAULTS).is_err());
    }

    #[test]
    fn retention_rejects_windows_past_the_cap() {
        assert!(Retention::resolve(Some(Retention::MAX_DAYS), None, DEFAULTS).is_ok());
        let err = Retention::resolve(None, Some(Retention::MAX_DAYS + 1), DEFAULTS).unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        assert!(Retention::resolve(Some(i64::MAX), None, DEFAULTS).is_err());
    }

    #[test]
    fn cutoff_reports_overflow_instead_of_panicking() {
        let now = Utc::now();
        assert_eq!(cutoff(now, 7).unwrap(), now - TimeDelta::days(7));
        assert!(cutoff(now, i64::MAX).is_err());
        assert!(cutoff(now, 200_000_000).is_err());
    }
}
