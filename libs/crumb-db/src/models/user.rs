use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub full_name: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub is_active: bool,
    pub is_admin: bool,
    pub is_staff: bool,
    pub is_verified: bool,
    pub date_joined: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl User {
    /// Staff members get the same administrative surface as admins.
    pub fn has_admin_access(&self) -> bool {
        self.is_admin || self.is_staff
    }
}

/// Lower-cases and trims an email so lookups are case-insensitive.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(is_admin: bool, is_staff: bool) -> User {
        User {
            id: Uuid::new_v4(),
            email: "a@b.io".into(),
            full_name: "A".into(),
            password_hash: "x".into(),
            is_active: true,
            is_admin,
            is_staff,
            is_verified: false,
            date_joined: Utc::now(),
            last_login: None,
        }
    }

    #[test]
    fn staff_or_admin_grants_admin_access() {
        assert!(user(true, false).has_admin_access());
        assert!(user(false, true).has_admin_access());
        assert!(!user(false, false).has_admin_access());
    }

    #[test]
    fn password_hash_is_never_serialized() {
        let json = serde_json::to_value(user(false, false)).unwrap();
        assert!(json.get("password_hash").is_none());
        assert_eq!(json["email"], "a@b.io");
    }

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(normalize_email("  Jane.Doe@Example.COM "), "jane.doe@example.com");
    }
}
