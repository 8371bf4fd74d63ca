use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::text_enum;

text_enum! {
    pub enum PaymentStatus : "payment status" {
        Pending => "pending",
        Success => "success",
        Failed => "failed",
        Refunded => "refunded",
    }
}

impl PaymentStatus {
    /// pending -> success|failed, success -> refunded.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (PaymentStatus::Pending, PaymentStatus::Success)
                | (PaymentStatus::Pending, PaymentStatus::Failed)
                | (PaymentStatus::Success, PaymentStatus::Refunded)
        )
    }
}

text_enum! {
    pub enum PaymentMethod : "payment method" {
        Stripe => "stripe",
        Paypal => "paypal",
        Crypto => "crypto",
    }
}

impl Default for PaymentMethod {
    fn default() -> Self {
        PaymentMethod::Stripe
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub amount_cents: i64,
    #[sqlx(try_from = "String")]
    pub status: PaymentStatus,
    #[sqlx(try_from = "String")]
    pub method: PaymentMethod,
    pub transaction_id: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sqlx(default)]
    pub plan_name: String,
    #[sqlx(default)]
    pub user_email: String,
}

impl Payment {
    /// Services chosen at purchase time, carried until the payment succeeds.
    pub fn selected_services(&self) -> Vec<Uuid> {
        self.metadata
            .get("selected_services")
            .and_then(|v| serde_json::from_value::<Vec<Uuid>>(v.clone()).ok())
            .unwrap_or_default()
    }
}

pub fn new_transaction_id() -> String {
    format!("TXN-{}", Uuid::new_v4().simple().to_string().to_uppercase())
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct MethodCount {
    pub method: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct MonthlyRevenue {
    pub month: String,
    pub revenue_cents: i64,
    pub payments: i64,
}

#[derive(Debug, Clone, Default, Serialize, FromRow)]
pub struct PaymentTotals {
    pub total_payments: i64,
    pub successful_payments: i64,
    pub failed_payments: i64,
    pub pending_payments: i64,
    pub refunded_payments: i64,
    pub total_revenue_cents: i64,
    pub refunded_amount_cents: i64,
}

impl PaymentTotals {
    /// Percentage of settled payments (success, refunded, failed) that succeeded.
    pub fn success_rate(&self) -> f64 {
        let settled = self.successful_payments + self.failed_payments + self.refunded_payments;
        if settled == 0 {
            return 0.0;
        }
        let succeeded = self.successful_payments + self.refunded_payments;
        (succeeded as f64 / settled as f64 * 10000.0).round() / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_ledger_transitions_are_allowed() {
        use PaymentStatus::*;
        assert!(Pending.can_transition_to(Success));
        assert!(Pending.can_transition_to(Failed));
        assert!(Success.can_transition_to(Refunded));
        assert!(!Failed.can_transition_to(Success));
        assert!(!Refunded.can_transition_to(Success));
        assert!(!Pending.can_transition_to(Refunded));
        assert!(!Success.can_transition_to(Failed));
    }

    #[test]
    fn transaction_ids_are_unique_and_prefixed() {
        let a = new_transaction_id();
        let b = new_transaction_id();
        assert!(a.starts_with("TXN-"));
        assert_eq!(a.len(), 36);
        assert_ne!(a, b);
    }

    #[test]
    fn success_rate_counts_refunds_as_successful_charges() {
        let totals = PaymentTotals {
            total_payments: 5,
            successful_payments: 2,
            failed_payments: 1,
            pending_payments: 1,
            refunded_payments: 1,
            ..Default::default()
        };
        assert_eq!(totals.success_rate(), 75.0);
        assert_eq!(PaymentTotals::default().success_rate(), 0.0);
    }

    #[test]
    fn selected_services_are_read_from_metadata() {
        let service = Uuid::new_v4();
        let payment = Payment {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            amount_cents: 100,
            status: PaymentStatus::Pending,
            method: PaymentMethod::Crypto,
            transaction_id: new_transaction_id(),
            metadata: json!({ "selected_services": [service] }),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            plan_name: String::new(),
            user_email: String::new(),
        };
        assert_eq!(payment.selected_services(), vec![service]);
    }
}
