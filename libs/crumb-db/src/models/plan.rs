use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub price_cents: i64,
    pub duration_days: i32,
    pub max_services: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[sqlx(default)]
    pub service_count: i64,
}

impl SubscriptionPlan {
    pub fn expiry_from(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start + Duration::days(self.duration_days as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub price_cents: i64,
    pub duration_days: i32,
    pub max_services: i32,
    #[serde(default)]
    pub service_ids: Vec<Uuid>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserSubscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub payment_id: Uuid,
    pub is_active: bool,
    pub purchased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[sqlx(default)]
    pub plan_name: String,
    #[sqlx(default)]
    pub plan_price_cents: i64,
    #[sqlx(default)]
    pub max_services: i32,
}

impl UserSubscription {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Active and not yet lapsed; only these grant entitlement.
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired(now)
    }

    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        if self.is_expired(now) {
            return 0;
        }
        (self.expires_at - now).num_days().max(0)
    }
}

/// Reasons a requested set of services cannot be attached to a plan.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("You can only select up to {max} services for this plan.")]
    TooMany { max: i32 },
    #[error("Service {0} was selected more than once.")]
    Duplicate(Uuid),
    #[error("Service {0} is not included in this plan.")]
    NotInPlan(Uuid),
    #[error("Service {0} does not exist or is inactive.")]
    Unavailable(Uuid),
}

/// Checks a service selection against a plan's bound and service list.
/// `plan_services` empty means the plan does not restrict the choice.
pub fn validate_selection(
    selected: &[Uuid],
    max_services: i32,
    plan_services: &[Uuid],
    active_services: &[Uuid],
) -> Result<(), SelectionError> {
    if selected.len() > max_services.max(0) as usize {
        return Err(SelectionError::TooMany { max: max_services });
    }

    let mut seen = std::collections::HashSet::new();
    for id in selected {
        if !seen.insert(*id) {
            return Err(SelectionError::Duplicate(*id));
        }
        if !active_services.contains(id) {
            return Err(SelectionError::Unavailable(*id));
        }
        if !plan_services.is_empty() && !plan_services.contains(id) {
            return Err(SelectionError::NotInPlan(*id));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(is_active: bool, expires_in: Duration) -> UserSubscription {
        let now = Utc::now();
        UserSubscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            payment_id: Uuid::new_v4(),
            is_active,
            purchased_at: now,
            expires_at: now + expires_in,
            plan_name: "Pro".into(),
            plan_price_cents: 2999,
            max_services: 3,
        }
    }

    #[test]
    fn days_remaining_is_zero_once_expired() {
        let now = Utc::now();
        let sub = subscription(true, Duration::days(-1));
        assert!(sub.is_expired(now));
        assert_eq!(sub.days_remaining(now), 0);
        assert!(!sub.is_current(now));
    }

    #[test]
    fn days_remaining_counts_whole_days() {
        let sub = subscription(true, Duration::days(10) + Duration::hours(5));
        assert_eq!(sub.days_remaining(sub.purchased_at), 10);
    }

    #[test]
    fn cancelled_subscription_is_not_current() {
        let sub = subscription(false, Duration::days(30));
        assert!(!sub.is_current(Utc::now()));
    }

    #[test]
    fn plan_expiry_adds_duration() {
        let now = Utc::now();
        let plan = SubscriptionPlan {
            id: Uuid::new_v4(),
            name: "Basic".into(),
            description: String::new(),
            price_cents: 999,
            duration_days: 30,
            max_services: 1,
            is_active: true,
            created_at: now,
            service_count: 0,
        };
        assert_eq!(plan.expiry_from(now) - now, Duration::days(30));
    }

    #[test]
    fn selection_over_max_is_rejected() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let err = validate_selection(&[a, b], 1, &[], &[a, b]).unwrap_err();
        assert_eq!(err, SelectionError::TooMany { max: 1 });
    }

    #[test]
    fn selection_must_stay_within_plan_services() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let err = validate_selection(&[b], 2, &[a], &[a, b]).unwrap_err();
        assert_eq!(err, SelectionError::NotInPlan(b));
        assert!(validate_selection(&[a], 2, &[a], &[a, b]).is_ok());
    }

    #[test]
    fn selection_rejects_duplicates_and_inactive_services() {
        let a = Uuid::new_v4();
        let gone = Uuid::new_v4();
        assert_eq!(
            validate_selection(&[a, a], 3, &[], &[a]).unwrap_err(),
            SelectionError::Duplicate(a)
        );
        assert_eq!(
            validate_selection(&[gone], 3, &[], &[a]).unwrap_err(),
            SelectionError::Unavailable(gone)
        );
    }

    #[test]
    fn empty_selection_is_always_allowed() {
        assert!(validate_selection(&[], 1, &[Uuid::new_v4()], &[]).is_ok());
    }
}
