pub mod user_repo;
pub mod token_repo;
pub mod service_repo;
pub mod plan_repo;
pub mod subscription_repo;
pub mod payment_repo;
pub mod login_service_repo;
pub mod user_service_repo;
pub mod cookie_repo;
pub mod injection_log_repo;
pub mod extraction_job_repo;

/// Limit/offset window for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub const DEFAULT_LIMIT: i64 = 50;
    pub const MAX_LIMIT: i64 = 200;

    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Self {
        Self {
            limit: limit
                .unwrap_or(Self::DEFAULT_LIMIT)
                .clamp(1, Self::MAX_LIMIT),
            offset: offset.unwrap_or(0).max(0),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// (user_id, service_id) pairs a user is currently entitled to through an
/// active, unexpired subscription. A subscription with selected services
/// covers exactly those; one without a selection covers its plan's services.
pub(crate) const ENTITLEMENTS: &str = "
    SELECT us.user_id, sss.service_id
    FROM user_subscriptions us
    JOIN subscription_selected_services sss ON sss.subscription_id = us.id
    WHERE us.is_active = TRUE AND us.expires_at > NOW()
    UNION
    SELECT us.user_id, ps.service_id
    FROM user_subscriptions us
    JOIN plan_services ps ON ps.plan_id = us.plan_id
    WHERE us.is_active = TRUE AND us.expires_at > NOW()
      AND NOT EXISTS (
          SELECT 1 FROM subscription_selected_services x WHERE x.subscription_id = us.id
      )";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_defaults_and_clamps() {
        assert_eq!(Page::default(), Page { limit: 50, offset: 0 });
        assert_eq!(Page::new(Some(1000), Some(-5)), Page { limit: 200, offset: 0 });
        assert_eq!(Page::new(Some(0), Some(20)), Page { limit: 1, offset: 20 });
    }

    #[test]
    fn entitlement_query_uses_positional_free_sql() {
        assert!(!ENTITLEMENTS.contains('$'));
        assert!(ENTITLEMENTS.contains("UNION"));
    }
}
