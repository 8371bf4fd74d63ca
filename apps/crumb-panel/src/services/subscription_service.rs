use chrono::Utc;
use crumb_db::models::catalog::Service;
use crumb_db::models::plan::{PlanInput, SubscriptionPlan, UserSubscription, validate_selection};
use crumb_db::repositories::Page;
use crumb_db::repositories::plan_repo::PlanRepository;
use crumb_db::repositories::service_repo::ServiceRepository;
use crumb_db::repositories::subscription_repo::{
    PlanPopularity, SubscriptionRepository, SubscriptionTotals,
};
use crumb_db::repositories::user_service_repo::UserServiceRepository;
use serde::Serialize;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Debug, Serialize)]
pub struct PlanDetail {
    #[serde(flatten)]
    pub plan: SubscriptionPlan,
    pub services: Vec<Service>,
    pub subscriber_count: i64,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    #[serde(flatten)]
    pub subscription: UserSubscription,
    pub is_expired: bool,
    pub days_remaining: i64,
    pub selected_services: Vec<Uuid>,
    pub accessible_services_count: i64,
}

#[derive(Debug, Serialize)]
pub struct UserSubscriptionStats {
    #[serde(flatten)]
    pub totals: SubscriptionTotals,
    pub total_spent_cents: i64,
    pub service_allowance: i64,
    pub accessible_services: usize,
}

#[derive(Debug, Serialize)]
pub struct AdminSubscriptionStats {
    #[serde(flatten)]
    pub totals: SubscriptionTotals,
    pub plans: Vec<PlanPopularity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanRemoval {
    Deleted,
    /// The plan has purchases on record and was only deactivated.
    Deactivated,
}

#[derive(Debug, Clone)]
pub struct SubscriptionService {
    plan_repo: PlanRepository,
    sub_repo: SubscriptionRepository,
    service_repo: ServiceRepository,
    user_service_repo: UserServiceRepository,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            plan_repo: PlanRepository::new(pool.clone()),
            sub_repo: SubscriptionRepository::new(pool.clone()),
            service_repo: ServiceRepository::new(pool.clone()),
            user_service_repo: UserServiceRepository::new(pool),
        }
    }

    pub async fn list_plans(&self, active_only: bool) -> AppResult<Vec<SubscriptionPlan>> {
        Ok(self.plan_repo.list(active_only).await?)
    }

    pub async fn get_plan(&self, id: Uuid) -> AppResult<SubscriptionPlan> {
        self.plan_repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found("Subscription plan not found."))
    }

    pub async fn plan_detail(&self, id: Uuid, active_only: bool) -> AppResult<PlanDetail> {
        let plan = self.get_plan(id).await?;
        if active_only && !plan.is_active {
            return Err(AppError::not_found("Subscription plan not found."));
        }
        let services = self.plan_repo.services(id).await?;
        let subscriber_count = self.plan_repo.subscriber_count(id).await?;
        Ok(PlanDetail {
            plan,
            services,
            subscriber_count,
        })
    }

    pub async fn create_plan(&self, input: PlanInput) -> AppResult<SubscriptionPlan> {
        let input = self.validate_plan(input).await?;
        let plan = self.plan_repo.create(&input).await?;
        info!(plan_id = %plan.id, name = %plan.name, "Created subscription plan");
        Ok(plan)
    }

    pub async fn update_plan(&self, id: Uuid, input: PlanInput) -> AppResult<SubscriptionPlan> {
        let input = self.validate_plan(input).await?;
        self.plan_repo
            .update(id, &input)
            .await?
            .ok_or_else(|| AppError::not_found("Subscription plan not found."))
    }

    pub async fn remove_plan(&self, id: Uuid) -> AppResult<PlanRemoval> {
        self.get_plan(id).await?;
        if self.plan_repo.usage_count(id).await? > 0 {
            self.plan_repo.deactivate(id).await?;
            info!(plan_id = %id, "Plan has purchases; deactivated instead of deleting");
            return Ok(PlanRemoval::Deactivated);
        }
        self.plan_repo.delete(id).await?;
        info!(plan_id = %id, "Deleted subscription plan");
        Ok(PlanRemoval::Deleted)
    }

    async fn validate_plan(&self, mut input: PlanInput) -> AppResult<PlanInput> {
        input.name = input.name.trim().to_string();
        if input.name.is_empty() || input.name.chars().count() > 50 {
            return Err(AppError::bad_request("Plan name must be between 1 and 50 characters."));
        }
        if input.price_cents < 0 {
            return Err(AppError::bad_request("Price cannot be negative."));
        }
        if input.duration_days <= 0 {
            return Err(AppError::bad_request("Duration must be at least one day."));
        }
        if input.max_services <= 0 {
            return Err(AppError::bad_request("A plan must allow at least one service."));
        }

        input.service_ids.sort();
        input.service_ids.dedup();
        let active = self.service_repo.active_ids(&input.service_ids).await?;
        if let Some(missing) = input.service_ids.iter().find(|id| !active.contains(id)) {
            return Err(AppError::bad_request(format!(
                "Service {missing} does not exist or is inactive."
            )));
        }
        Ok(input)
    }

    /// Checks a selection of services against the plan's bound and service list.
    pub async fn check_selection(&self, plan: &SubscriptionPlan, selected: &[Uuid]) -> AppResult<()> {
        let plan_services = self.plan_repo.service_ids(plan.id).await?;
        let active = self.service_repo.active_ids(selected).await?;
        validate_selection(selected, plan.max_services, &plan_services, &active)
            .map_err(|e| AppError::bad_request(e.to_string()))
    }

    pub async fn list_for_user(&self, user_id: Uuid, current_only: bool) -> AppResult<Vec<SubscriptionView>> {
        let subs = self.sub_repo.list_for_user(user_id, current_only).await?;
        let mut views = Vec::with_capacity(subs.len());
        for sub in subs {
            views.push(self.view(sub).await?);
        }
        Ok(views)
    }

    pub async fn list_all(&self, active: Option<bool>, page: Page) -> AppResult<Vec<SubscriptionView>> {
        let subs = self.sub_repo.list_all(active, page).await?;
        let mut views = Vec::with_capacity(subs.len());
        for sub in subs {
            views.push(self.view(sub).await?);
        }
        Ok(views)
    }

    pub async fn view(&self, subscription: UserSubscription) -> AppResult<SubscriptionView> {
        let now = Utc::now();
        let selected_services = self.sub_repo.selected_services(subscription.id).await?;
        let accessible_services_count = self.sub_repo.accessible_services_count(subscription.id).await?;
        Ok(SubscriptionView {
            is_expired: subscription.is_expired(now),
            days_remaining: subscription.days_remaining(now),
            subscription,
            selected_services,
            accessible_services_count,
        })
    }

    async fn own_subscription(&self, id: Uuid, user_id: Uuid) -> AppResult<UserSubscription> {
        self.sub_repo
            .get_by_id(id)
            .await?
            .filter(|s| s.user_id == user_id)
            .ok_or_else(|| AppError::not_found("Subscription not found."))
    }

    /// Replaces the services chosen for one of the user's current subscriptions.
    /// Assignments that lose their entitlement are released.
    pub async fn update_selected_services(
        &self,
        id: Uuid,
        user_id: Uuid,
        selected: Vec<Uuid>,
    ) -> AppResult<SubscriptionView> {
        let subscription = self.own_subscription(id, user_id).await?;
        if !subscription.is_current(Utc::now()) {
            return Err(AppError::bad_request("Only active subscriptions can be changed."));
        }
        let plan = self.get_plan(subscription.plan_id).await?;
        self.check_selection(&plan, &selected).await?;

        self.sub_repo.replace_selected_services(id, &selected).await?;
        let released = self.user_service_repo.release_unentitled(Some(user_id)).await?;
        if released > 0 {
            info!(user_id = %user_id, released, "Released assignments after selection change");
        }

        let refreshed = self.own_subscription(id, user_id).await?;
        self.view(refreshed).await
    }

    pub async fn cancel(&self, id: Uuid, user_id: Uuid) -> AppResult<SubscriptionView> {
        let subscription = self.own_subscription(id, user_id).await?;
        if !self.sub_repo.deactivate(subscription.id).await? {
            return Err(AppError::bad_request("Subscription is already cancelled."));
        }
        let released = self.user_service_repo.release_unentitled(Some(user_id)).await?;
        info!(subscription_id = %id, user_id = %user_id, released, "Subscription cancelled");

        let refreshed = self.own_subscription(id, user_id).await?;
        self.view(refreshed).await
    }

    pub async fn user_stats(&self, user_id: Uuid) -> AppResult<UserSubscriptionStats> {
        Ok(UserSubscriptionStats {
            totals: self.sub_repo.totals(Some(user_id)).await?,
            total_spent_cents: self.sub_repo.total_spent_cents(user_id).await?,
            service_allowance: self.sub_repo.service_allowance(user_id).await?,
            accessible_services: self.service_repo.accessible_for_user(user_id).await?.len(),
        })
    }

    pub async fn admin_stats(&self) -> AppResult<AdminSubscriptionStats> {
        Ok(AdminSubscriptionStats {
            totals: self.sub_repo.totals(None).await?,
            plans: self.sub_repo.plan_popularity().await?,
        })
    }
}
