use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::text_enum;

text_enum! {
    pub enum CookieStatus : "cookie status" {
        Valid => "valid",
        Expired => "expired",
        Invalid => "invalid",
        PendingValidation => "pending_validation",
    }
}

impl CookieStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CookieStatus::Expired | CookieStatus::Invalid)
    }

    /// Status a cookie should hold after a validation pass at `now`.
    /// Expiry wins over a lost assignment.
    pub fn evaluate(
        current: CookieStatus,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
        assignment_active: bool,
    ) -> CookieStatus {
        if current.is_terminal() {
            return current;
        }
        if now >= expires_at {
            CookieStatus::Expired
        } else if !assignment_active {
            CookieStatus::Invalid
        } else {
            CookieStatus::Valid
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Cookie {
    pub id: Uuid,
    pub user_service_id: Uuid,
    pub cookie_data: serde_json::Value,
    pub session_id: Option<String>,
    pub extracted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_validated: Option<DateTime<Utc>>,
    #[sqlx(try_from = "String")]
    pub status: CookieStatus,
    pub validation_attempts: i32,
    #[sqlx(default)]
    pub service_id: Option<Uuid>,
    #[sqlx(default)]
    pub user_id: Option<Uuid>,
}

impl Cookie {
    /// A cookie may be handed out only while valid and unexpired.
    pub fn is_servable(&self, now: DateTime<Utc>) -> bool {
        self.status == CookieStatus::Valid && self.expires_at > now
    }
}

/// Row for a batch validation pass.
#[derive(Debug, Clone, FromRow)]
pub struct CookieCheck {
    pub id: Uuid,
    #[sqlx(try_from = "String")]
    pub status: CookieStatus,
    pub expires_at: DateTime<Utc>,
    pub assignment_active: bool,
}

text_enum! {
    pub enum InjectionStatus : "injection status" {
        Success => "success",
        Failure => "failure",
        Expired => "expired",
        Invalid => "invalid",
        AccessDenied => "access_denied",
    }
}

impl From<CookieStatus> for InjectionStatus {
    fn from(status: CookieStatus) -> Self {
        match status {
            CookieStatus::Expired => InjectionStatus::Expired,
            CookieStatus::Invalid => InjectionStatus::Invalid,
            CookieStatus::Valid | CookieStatus::PendingValidation => InjectionStatus::Failure,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CookieInjectionLog {
    pub id: Uuid,
    pub cookie_id: Option<Uuid>,
    pub user_id: Uuid,
    pub service_id: Option<Uuid>,
    #[sqlx(try_from = "String")]
    pub status: InjectionStatus,
    pub message: String,
    #[sqlx(rename = "created_at")]
    pub timestamp: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Fields for a new injection log row.
#[derive(Debug, Clone)]
pub struct NewInjectionLog {
    pub cookie_id: Option<Uuid>,
    pub user_id: Uuid,
    pub service_id: Option<Uuid>,
    pub status: InjectionStatus,
    pub message: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

text_enum! {
    pub enum JobStatus : "extraction job status" {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl JobStatus {
    pub fn can_cancel(&self) -> bool {
        matches!(self, JobStatus::Pending)
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CookieExtractionJob {
    pub id: Uuid,
    pub login_service_id: Uuid,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub extracted_cookies_count: i32,
}

impl CookieExtractionJob {
    pub fn duration_secs(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }
}

/// Outcome of one validation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationSummary {
    pub checked: usize,
    pub valid: usize,
    pub expired: usize,
    pub invalid: usize,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn evaluate_expires_lapsed_cookies_first() {
        let now = Utc::now();
        let past = now - Duration::minutes(1);
        assert_eq!(
            CookieStatus::evaluate(CookieStatus::Valid, past, now, false),
            CookieStatus::Expired
        );
        assert_eq!(
            CookieStatus::evaluate(CookieStatus::PendingValidation, now, now, true),
            CookieStatus::Expired
        );
    }

    #[test]
    fn evaluate_invalidates_cookies_of_released_assignments() {
        let now = Utc::now();
        let later = now + Duration::hours(1);
        assert_eq!(
            CookieStatus::evaluate(CookieStatus::PendingValidation, later, now, false),
            CookieStatus::Invalid
        );
        assert_eq!(
            CookieStatus::evaluate(CookieStatus::PendingValidation, later, now, true),
            CookieStatus::Valid
        );
    }

    #[test]
    fn terminal_states_never_revive() {
        let now = Utc::now();
        let later = now + Duration::hours(1);
        assert_eq!(
            CookieStatus::evaluate(CookieStatus::Invalid, later, now, true),
            CookieStatus::Invalid
        );
        assert_eq!(
            CookieStatus::evaluate(CookieStatus::Expired, later, now, true),
            CookieStatus::Expired
        );
    }

    #[test]
    fn only_valid_unexpired_cookies_are_servable() {
        let now = Utc::now();
        let mut cookie = Cookie {
            id: Uuid::new_v4(),
            user_service_id: Uuid::new_v4(),
            cookie_data: serde_json::json!({ "sessionid": "abc" }),
            session_id: Some("abc".into()),
            extracted_at: now,
            expires_at: now + Duration::hours(2),
            last_validated: None,
            status: CookieStatus::PendingValidation,
            validation_attempts: 0,
            service_id: None,
            user_id: None,
        };
        assert!(!cookie.is_servable(now));
        cookie.status = CookieStatus::Valid;
        assert!(cookie.is_servable(now));
        cookie.expires_at = now;
        assert!(!cookie.is_servable(now));
    }

    #[test]
    fn failed_fetch_maps_latest_cookie_state_to_log_status() {
        assert_eq!(InjectionStatus::from(CookieStatus::Expired), InjectionStatus::Expired);
        assert_eq!(InjectionStatus::from(CookieStatus::Invalid), InjectionStatus::Invalid);
        assert_eq!(
            InjectionStatus::from(CookieStatus::PendingValidation),
            InjectionStatus::Failure
        );
        assert_eq!(InjectionStatus::AccessDenied.as_str(), "access_denied");
    }

    #[test]
    fn only_pending_jobs_can_be_cancelled() {
        assert!(JobStatus::Pending.can_cancel());
        for status in [JobStatus::InProgress, JobStatus::Completed, JobStatus::Failed] {
            assert!(!status.can_cancel());
        }
        assert!(JobStatus::Cancelled.is_finished());
        assert!(!JobStatus::InProgress.is_finished());
        assert_eq!("in_progress".parse::<JobStatus>().unwrap(), JobStatus::InProgress);
        assert!("running".parse::<JobStatus>().is_err());
    }
}
