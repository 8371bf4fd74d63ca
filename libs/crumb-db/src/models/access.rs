use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::text_enum;

/// A pooled credential set shared by up to `max_concurrent_users` assignments.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LoginService {
    pub id: Uuid,
    pub service_id: Uuid,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub encrypted_password: String,
    pub additional_credentials: serde_json::Value,
    pub is_active: bool,
    pub max_concurrent_users: i32,
    pub current_users: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login_attempt: Option<DateTime<Utc>>,
    #[sqlx(default)]
    pub service_name: String,
}

impl LoginService {
    pub fn can_assign_user(&self) -> bool {
        self.is_active && self.current_users < self.max_concurrent_users
    }

    pub fn available_slots(&self) -> i32 {
        (self.max_concurrent_users - self.current_users).max(0)
    }

    /// Reads a string option from `additional_credentials`.
    pub fn credential_option(&self, key: &str) -> Option<&str> {
        self.additional_credentials.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginServiceInput {
    pub service_id: Uuid,
    pub username: String,
    pub password: String,
    #[serde(default = "empty_object")]
    pub additional_credentials: serde_json::Value,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_max_users")]
    pub max_concurrent_users: i32,
}

/// Partial update; a missing password keeps the stored one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginServiceUpdate {
    pub username: Option<String>,
    pub password: Option<String>,
    pub additional_credentials: Option<serde_json::Value>,
    pub is_active: Option<bool>,
    pub max_concurrent_users: Option<i32>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

fn default_true() -> bool {
    true
}

fn default_max_users() -> i32 {
    5
}

text_enum! {
    pub enum UserServiceStatus : "user service status" {
        Pending => "pending",
        Active => "active",
        Inactive => "inactive",
        Suspended => "suspended",
    }
}

impl UserServiceStatus {
    /// States that count toward a user's service allowance.
    pub fn holds_allowance(&self) -> bool {
        matches!(self, UserServiceStatus::Pending | UserServiceStatus::Active)
    }

    /// Only an inactive assignment can be requested again.
    pub fn can_rerequest(&self) -> bool {
        matches!(self, UserServiceStatus::Inactive)
    }

    pub fn can_transition_to(&self, next: UserServiceStatus) -> bool {
        use UserServiceStatus::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Inactive)
                | (Active, Inactive)
                | (Active, Suspended)
                | (Suspended, Pending)
                | (Inactive, Pending)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserService {
    pub id: Uuid,
    pub user_id: Uuid,
    pub service_id: Uuid,
    pub login_service_id: Option<Uuid>,
    #[sqlx(try_from = "String")]
    pub status: UserServiceStatus,
    pub assigned_at: DateTime<Utc>,
    pub last_accessed: Option<DateTime<Utc>>,
    pub access_count: i32,
    #[sqlx(default)]
    pub service_name: String,
    #[sqlx(default)]
    pub user_email: String,
    #[sqlx(default)]
    pub has_valid_cookies: bool,
    #[sqlx(default)]
    pub last_cookie_update: Option<DateTime<Utc>>,
}

/// Result of trying to activate a pending assignment.
#[derive(Debug, Clone)]
pub enum Activation {
    Activated {
        assignment: UserService,
        login_service: LoginService,
    },
    NotPending(UserServiceStatus),
    NoCapacity,
}

/// Result of releasing an assignment into `inactive` or `suspended`.
#[derive(Debug, Clone)]
pub enum Release {
    Released {
        assignment: UserService,
        freed_login_service: Option<Uuid>,
    },
    InvalidState(UserServiceStatus),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pool(max: i32, current: i32, active: bool) -> LoginService {
        LoginService {
            id: Uuid::new_v4(),
            service_id: Uuid::new_v4(),
            username: "shared@example.com".into(),
            encrypted_password: "enc:v1:secret".into(),
            additional_credentials: json!({ "username_field": "login" }),
            is_active: active,
            max_concurrent_users: max,
            current_users: current,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_login_attempt: None,
            service_name: String::new(),
        }
    }

    #[test]
    fn capacity_is_bounded_by_max_users() {
        assert!(pool(2, 1, true).can_assign_user());
        assert!(!pool(2, 2, true).can_assign_user());
        assert!(!pool(2, 0, false).can_assign_user());
        assert_eq!(pool(5, 2, true).available_slots(), 3);
        assert_eq!(pool(2, 3, true).available_slots(), 0);
    }

    #[test]
    fn password_is_never_serialized() {
        let value = serde_json::to_value(pool(1, 0, true)).unwrap();
        assert!(value.get("encrypted_password").is_none());
        assert_eq!(value["username"], "shared@example.com");
    }

    #[test]
    fn credential_options_are_read_as_strings() {
        let ls = pool(1, 0, true);
        assert_eq!(ls.credential_option("username_field"), Some("login"));
        assert_eq!(ls.credential_option("password_field"), None);
    }

    #[test]
    fn assignment_lifecycle() {
        use UserServiceStatus::*;
        assert!(Pending.can_transition_to(Active));
        assert!(Pending.can_transition_to(Inactive));
        assert!(Active.can_transition_to(Suspended));
        assert!(Active.can_transition_to(Inactive));
        assert!(Suspended.can_transition_to(Pending));
        assert!(!Suspended.can_transition_to(Active));
        assert!(!Inactive.can_transition_to(Active));
        assert!(!Active.can_transition_to(Pending));
    }

    #[test]
    fn allowance_counts_pending_and_active_only() {
        let holding: Vec<_> = UserServiceStatus::ALL
            .iter()
            .filter(|s| s.holds_allowance())
            .collect();
        assert_eq!(holding, vec![&UserServiceStatus::Pending, &UserServiceStatus::Active]);
        assert!(UserServiceStatus::Inactive.can_rerequest());
        assert!(!UserServiceStatus::Suspended.can_rerequest());
    }

    #[test]
    fn input_defaults() {
        let input: LoginServiceInput = serde_json::from_value(json!({
            "service_id": Uuid::new_v4(),
            "username": "u",
            "password": "p"
        }))
        .unwrap();
        assert_eq!(input.max_concurrent_users, 5);
        assert!(input.is_active);
        assert!(input.additional_credentials.as_object().unwrap().is_empty());
    }
}
