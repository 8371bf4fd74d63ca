use std::sync::Arc;

use chrono::Utc;
use crumb_db::models::payment::{
    MethodCount, MonthlyRevenue, Payment, PaymentMethod, PaymentStatus, PaymentTotals,
};
use crumb_db::repositories::Page;
use crumb_db::repositories::payment_repo::PaymentRepository;
use crumb_db::repositories::user_service_repo::UserServiceRepository;
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::services::subscription_service::{SubscriptionService, SubscriptionView};

const REVENUE_MONTHS: i32 = 12;

#[derive(Debug, Serialize)]
pub struct ProcessedPayment {
    pub payment: Payment,
    pub subscription: Option<SubscriptionView>,
}

#[derive(Debug, Serialize)]
pub struct PaymentStats {
    #[serde(flatten)]
    pub totals: PaymentTotals,
    pub success_rate: f64,
    pub methods: Vec<MethodCount>,
    pub monthly_revenue: Vec<MonthlyRevenue>,
}

/// Gateway callback payload for a pending payment.
#[derive(Debug, Clone)]
pub struct GatewayResult {
    pub status: PaymentStatus,
    pub external_transaction_id: Option<String>,
    pub gateway_response: Option<serde_json::Value>,
}

/// Payment ledger. A successful payment opens the subscription it paid for.
#[derive(Clone)]
pub struct BillingService {
    payment_repo: PaymentRepository,
    user_service_repo: UserServiceRepository,
    subscriptions: Arc<SubscriptionService>,
}

impl BillingService {
    pub fn new(pool: PgPool, subscriptions: Arc<SubscriptionService>) -> Self {
        Self {
            payment_repo: PaymentRepository::new(pool.clone()),
            user_service_repo: UserServiceRepository::new(pool),
            subscriptions,
        }
    }

    /// Opens a pending payment for a plan, carrying the chosen services
    /// until the payment succeeds.
    pub async fn create_payment(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        selected_services: Vec<Uuid>,
        method: PaymentMethod,
    ) -> AppResult<Payment> {
        let plan = self.subscriptions.get_plan(plan_id).await?;
        if !plan.is_active {
            return Err(AppError::bad_request("This subscription plan is not available."));
        }
        self.subscriptions.check_selection(&plan, &selected_services).await?;

        let metadata = json!({
            "plan_name": plan.name,
            "selected_services": selected_services,
        });
        let payment = self
            .payment_repo
            .create(user_id, plan.id, plan.price_cents, method, &metadata)
            .await?;

        info!(
            payment_id = %payment.id,
            user_id = %user_id,
            plan_id = %plan.id,
            amount_cents = payment.amount_cents,
            "Created pending payment"
        );
        Ok(payment)
    }

    pub async fn process(
        &self,
        user_id: Uuid,
        payment_id: Uuid,
        result: GatewayResult,
    ) -> AppResult<ProcessedPayment> {
        let payment = self.user_payment(user_id, payment_id).await?;
        if payment.status != PaymentStatus::Pending {
            return Err(AppError::bad_request("Payment has already been processed."));
        }

        let mut patch = json!({ "processed_at": Utc::now() });
        if let Some(external) = &result.external_transaction_id {
            patch["external_transaction_id"] = json!(external);
        }
        if let Some(response) = &result.gateway_response {
            patch["gateway_response"] = response.clone();
        }

        match result.status {
            PaymentStatus::Success => {
                let plan = self.subscriptions.get_plan(payment.plan_id).await?;
                let (payment, subscription) = self
                    .payment_repo
                    .complete(
                        payment.id,
                        user_id,
                        plan.duration_days,
                        &payment.selected_services(),
                        &patch,
                    )
                    .await?
                    .ok_or_else(|| AppError::bad_request("Payment has already been processed."))?;

                info!(
                    payment_id = %payment.id,
                    subscription_id = %subscription.id,
                    expires_at = %subscription.expires_at,
                    "Payment succeeded; subscription activated"
                );
                let view = self.subscriptions.view(subscription).await?;
                Ok(ProcessedPayment {
                    payment,
                    subscription: Some(view),
                })
            }
            PaymentStatus::Failed => {
                let payment = self
                    .payment_repo
                    .fail(payment.id, user_id, &patch)
                    .await?
                    .ok_or_else(|| AppError::bad_request("Payment has already been processed."))?;
                warn!(payment_id = %payment.id, "Payment failed");
                Ok(ProcessedPayment {
                    payment,
                    subscription: None,
                })
            }
            other => Err(AppError::bad_request(format!(
                "Payment status must be 'success' or 'failed', got '{other}'."
            ))),
        }
    }

    pub async fn user_payments(&self, user_id: Uuid, page: Page) -> AppResult<Vec<Payment>> {
        Ok(self.payment_repo.list_for_user(user_id, page).await?)
    }

    pub async fn user_payment(&self, user_id: Uuid, payment_id: Uuid) -> AppResult<Payment> {
        self.payment_repo
            .get_for_user(payment_id, user_id)
            .await?
            .ok_or_else(|| AppError::not_found("Payment not found."))
    }

    pub async fn user_stats(&self, user_id: Uuid) -> AppResult<PaymentTotals> {
        Ok(self.payment_repo.totals(Some(user_id)).await?)
    }

    pub async fn list_all(
        &self,
        status: Option<PaymentStatus>,
        method: Option<PaymentMethod>,
        page: Page,
    ) -> AppResult<Vec<Payment>> {
        Ok(self.payment_repo.list_all(status, method, page).await?)
    }

    pub async fn get(&self, payment_id: Uuid) -> AppResult<Payment> {
        self.payment_repo
            .get_by_id(payment_id)
            .await?
            .ok_or_else(|| AppError::not_found("Payment not found."))
    }

    /// Refunds a successful payment (fully unless `amount_cents` is given),
    /// cancels its subscription and releases assignments it was funding.
    pub async fn refund(
        &self,
        payment_id: Uuid,
        reason: Option<String>,
        amount_cents: Option<i64>,
    ) -> AppResult<Payment> {
        let payment = self.get(payment_id).await?;
        if !payment.status.can_transition_to(PaymentStatus::Refunded) {
            return Err(AppError::bad_request("Only successful payments can be refunded."));
        }
        let amount = refund_amount(payment.amount_cents, amount_cents)?;

        let patch = json!({
            "refund_reason": reason.unwrap_or_else(|| "Admin refund".to_string()),
            "refund_amount_cents": amount,
            "refunded_at": Utc::now(),
        });
        let (payment, subscription) = self
            .payment_repo
            .refund(payment.id, &patch)
            .await?
            .ok_or_else(|| AppError::bad_request("Only successful payments can be refunded."))?;

        let released = self
            .user_service_repo
            .release_unentitled(Some(payment.user_id))
            .await?;
        info!(
            payment_id = %payment.id,
            amount_cents = amount,
            subscription_id = ?subscription.map(|s| s.id),
            released,
            "Payment refunded"
        );
        Ok(payment)
    }

    pub async fn admin_stats(&self) -> AppResult<PaymentStats> {
        let totals = self.payment_repo.totals(None).await?;
        Ok(PaymentStats {
            success_rate: totals.success_rate(),
            totals,
            methods: self.payment_repo.method_counts().await?,
            monthly_revenue: self.payment_repo.monthly_revenue(REVENUE_MONTHS).await?,
        })
    }
}

fn refund_amount(paid: i64, requested: Option<i64>) -> AppResult<i64> {
    let amount = requested.unwrap_or(paid);
    if amount <= 0 {
        return Err(AppError::bad_request("Refund amount must be positive."));
    }
    if amount > paid {
        return Err(AppError::bad_request("Refund amount cannot exceed the amount paid."));
    }
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refund_defaults_to_full_amount() {
        assert_eq!(refund_amount(2999, None).unwrap(), 2999);
        assert_eq!(refund_amount(2999, Some(1000)).unwrap(), 1000);
    }

    #[test]
    fn refund_amount_is_bounded_by_payment() {
        assert!(matches!(refund_amount(2999, Some(3000)), Err(AppError::BadRequest(_))));
        assert!(matches!(refund_amount(2999, Some(0)), Err(AppError::BadRequest(_))));
    }
}
