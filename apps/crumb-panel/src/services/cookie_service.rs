use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crumb_db::models::cookie::{
    Cookie, CookieInjectionLog, CookieStatus, InjectionStatus, NewInjectionLog, ValidationSummary,
};
use crumb_db::repositories::Page;
use crumb_db::repositories::cookie_repo::CookieRepository;
use crumb_db::repositories::injection_log_repo::InjectionLogRepository;
use crumb_db::repositories::service_repo::ServiceRepository;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::services::access_service::AccessService;

/// Caller details recorded with every hand-out attempt.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ServedCookie {
    pub cookie_id: Uuid,
    pub service_id: Uuid,
    pub cookie_data: serde_json::Value,
    pub session_id: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Why no cookie could be served for an active assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub status: InjectionStatus,
    pub message: &'static str,
    pub not_found: bool,
}

/// Decides the logged status when nothing servable exists, based on the
/// newest cookie of the assignment.
pub fn classify_missing(latest: Option<&Cookie>, now: DateTime<Utc>) -> FetchFailure {
    match latest {
        None => FetchFailure {
            status: InjectionStatus::Failure,
            message: "No cookies are available for this service yet.",
            not_found: true,
        },
        Some(cookie) if cookie.status == CookieStatus::Expired || cookie.expires_at <= now => {
            FetchFailure {
                status: InjectionStatus::Expired,
                message: "The session for this service has expired; a new one is being prepared.",
                not_found: false,
            }
        }
        Some(cookie) if cookie.status == CookieStatus::Invalid => FetchFailure {
            status: InjectionStatus::Invalid,
            message: "The session for this service is no longer valid.",
            not_found: false,
        },
        Some(_) => FetchFailure {
            status: InjectionStatus::Failure,
            message: "The session for this service is still being validated.",
            not_found: false,
        },
    }
}

#[derive(Clone)]
pub struct CookieService {
    cookie_repo: CookieRepository,
    log_repo: InjectionLogRepository,
    service_repo: ServiceRepository,
    access: Arc<AccessService>,
}

impl CookieService {
    pub fn new(pool: PgPool, access: Arc<AccessService>) -> Self {
        Self {
            cookie_repo: CookieRepository::new(pool.clone()),
            log_repo: InjectionLogRepository::new(pool.clone()),
            service_repo: ServiceRepository::new(pool),
            access,
        }
    }

    /// Hands the newest valid cookie to an entitled user with active access.
    /// Every attempt, served or not, is written to the injection log.
    pub async fn fetch_for_user(
        &self,
        user_id: Uuid,
        service_id: Uuid,
        ctx: &RequestContext,
    ) -> AppResult<ServedCookie> {
        let service_exists = self.service_repo.get_by_id(service_id).await?.is_some();
        let logged_service = service_exists.then_some(service_id);

        let assignment = self.access.active_assignment(user_id, service_id).await?;
        let entitled = service_exists && self.access.is_entitled(user_id, service_id).await?;

        let Some(assignment) = assignment.filter(|_| entitled) else {
            let message = "You do not have active access to this service.";
            self.log(None, user_id, logged_service, InjectionStatus::AccessDenied, message, ctx)
                .await?;
            warn!(user_id = %user_id, service_id = %service_id, "Cookie request denied");
            return Err(AppError::forbidden(message));
        };

        if let Some(cookie) = self.cookie_repo.latest_servable(assignment.id).await? {
            self.log(
                Some(cookie.id),
                user_id,
                logged_service,
                InjectionStatus::Success,
                "Cookie served",
                ctx,
            )
            .await?;
            self.access.record_access(assignment.id).await?;
            debug!(user_id = %user_id, cookie_id = %cookie.id, "Cookie served");

            return Ok(ServedCookie {
                cookie_id: cookie.id,
                service_id,
                cookie_data: cookie.cookie_data,
                session_id: cookie.session_id,
                expires_at: cookie.expires_at,
            });
        }

        let latest = self.cookie_repo.latest(assignment.id).await?;
        let failure = classify_missing(latest.as_ref(), Utc::now());
        self.log(
            latest.as_ref().map(|c| c.id),
            user_id,
            logged_service,
            failure.status,
            failure.message,
            ctx,
        )
        .await?;

        if failure.not_found {
            Err(AppError::not_found(failure.message))
        } else {
            Err(AppError::bad_request(failure.message))
        }
    }

    async fn log(
        &self,
        cookie_id: Option<Uuid>,
        user_id: Uuid,
        service_id: Option<Uuid>,
        status: InjectionStatus,
        message: &str,
        ctx: &RequestContext,
    ) -> AppResult<()> {
        self.log_repo
            .insert(&NewInjectionLog {
                cookie_id,
                user_id,
                service_id,
                status,
                message: message.to_string(),
                ip_address: ctx.ip_address.clone(),
                user_agent: ctx.user_agent.clone(),
            })
            .await?;
        Ok(())
    }

    /// Re-evaluates live cookies (all of them, or only `ids`).
    pub async fn validate(&self, ids: Option<&[Uuid]>) -> AppResult<ValidationSummary> {
        let checks = self.cookie_repo.pending_checks(ids).await?;
        let now = Utc::now();

        let mut groups: HashMap<CookieStatus, Vec<Uuid>> = HashMap::new();
        for check in &checks {
            let next = CookieStatus::evaluate(check.status, check.expires_at, now, check.assignment_active);
            groups.entry(next).or_default().push(check.id);
        }

        let mut summary = ValidationSummary {
            checked: checks.len(),
            ..Default::default()
        };
        for (status, ids) in &groups {
            self.cookie_repo.apply_validation(ids, *status).await?;
            match status {
                CookieStatus::Valid => summary.valid += ids.len(),
                CookieStatus::Expired => summary.expired += ids.len(),
                CookieStatus::Invalid => summary.invalid += ids.len(),
                CookieStatus::PendingValidation => {}
            }
        }

        if summary.checked > 0 {
            info!(
                checked = summary.checked,
                valid = summary.valid,
                expired = summary.expired,
                invalid = summary.invalid,
                "Cookie validation pass finished"
            );
        }
        Ok(summary)
    }

    pub async fn list(
        &self,
        status: Option<CookieStatus>,
        service_id: Option<Uuid>,
        page: Page,
    ) -> AppResult<Vec<Cookie>> {
        Ok(self.cookie_repo.list(status, service_id, page).await?)
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Cookie> {
        self.cookie_repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found("Cookie not found."))
    }

    /// Admin override; only the terminal states may be set by hand.
    pub async fn set_status(&self, id: Uuid, status: CookieStatus) -> AppResult<Cookie> {
        if !status.is_terminal() {
            return Err(AppError::bad_request(
                "Cookie status can only be set to 'invalid' or 'expired'.",
            ));
        }
        let cookie = self
            .cookie_repo
            .set_status(id, status)
            .await?
            .ok_or_else(|| AppError::not_found("Cookie not found."))?;
        info!(cookie_id = %id, status = %status, "Cookie status overridden");
        Ok(cookie)
    }

    pub async fn delete(&self, id: Uuid) -> AppResult<()> {
        if !self.cookie_repo.delete(id).await? {
            return Err(AppError::not_found("Cookie not found."));
        }
        Ok(())
    }

    pub async fn activity(
        &self,
        status: Option<InjectionStatus>,
        user_id: Option<Uuid>,
        page: Page,
    ) -> AppResult<Vec<CookieInjectionLog>> {
        Ok(self.log_repo.list(status, user_id, page).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn cookie(status: CookieStatus, expires_in: Duration) -> Cookie {
        let now = Utc::now();
        Cookie {
            id: Uuid::new_v4(),
            user_service_id: Uuid::new_v4(),
            cookie_data: serde_json::json!({ "session": "abc" }),
            session_id: None,
            extracted_at: now,
            expires_at: now + expires_in,
            last_validated: None,
            status,
            validation_attempts: 1,
            service_id: None,
            user_id: None,
        }
    }

    #[test]
    fn no_cookie_at_all_is_not_found() {
        let failure = classify_missing(None, Utc::now());
        assert_eq!(failure.status, InjectionStatus::Failure);
        assert!(failure.not_found);
    }

    #[test]
    fn latest_cookie_state_decides_the_logged_status() {
        let now = Utc::now();
        let expired = cookie(CookieStatus::Expired, Duration::hours(-1));
        assert_eq!(classify_missing(Some(&expired), now).status, InjectionStatus::Expired);

        let lapsed_but_marked_valid = cookie(CookieStatus::Valid, Duration::seconds(-5));
        assert_eq!(
            classify_missing(Some(&lapsed_but_marked_valid), now).status,
            InjectionStatus::Expired
        );

        let invalid = cookie(CookieStatus::Invalid, Duration::hours(3));
        assert_eq!(classify_missing(Some(&invalid), now).status, InjectionStatus::Invalid);

        let pending = cookie(CookieStatus::PendingValidation, Duration::hours(3));
        let failure = classify_missing(Some(&pending), now);
        assert_eq!(failure.status, InjectionStatus::Failure);
        assert!(!failure.not_found);
    }
}
