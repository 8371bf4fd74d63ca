use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{get, post, put},
};
use crumb_db::models::payment::{Payment, PaymentMethod};
use crumb_db::models::plan::{PlanInput, SubscriptionPlan};
use crumb_db::models::user::User;
use crumb_db::repositories::Page;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::AppState;
use crate::api::{require_admin, require_auth};
use crate::error::AppResult;
use crate::services::subscription_service::{
    AdminSubscriptionStats, PlanDetail, SubscriptionView, UserSubscriptionStats,
};

#[derive(Deserialize)]
pub struct PurchaseRequest {
    pub subscription_plan_id: Uuid,
    #[serde(default)]
    pub selected_services: Vec<Uuid>,
    #[serde(default)]
    pub payment_method: PaymentMethod,
}

#[derive(Deserialize)]
pub struct SelectionRequest {
    pub selected_services: Vec<Uuid>,
}

#[derive(Deserialize)]
pub struct SubscriptionQuery {
    pub active: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub fn routes(state: AppState) -> Router<AppState> {
    let admin = Router::new()
        .route("/admin/plans", get(admin_list_plans).post(create_plan))
        .route(
            "/admin/plans/{id}",
            get(admin_get_plan).put(update_plan).delete(delete_plan),
        )
        .route("/admin/subscriptions", get(admin_subscriptions))
        .route("/admin/stats", get(admin_stats))
        .route_layer(middleware::from_fn(require_admin));

    Router::new()
        .route("/plans", get(list_plans))
        .route("/plans/{id}", get(get_plan))
        .route("/my-subscriptions", get(my_subscriptions))
        .route("/my-subscriptions/active", get(my_active_subscriptions))
        .route("/purchase", post(purchase))
        .route("/subscriptions/{id}/services", put(update_services))
        .route("/subscriptions/{id}/cancel", post(cancel))
        .route("/my-stats", get(my_stats))
        .merge(admin)
        .route_layer(middleware::from_fn_with_state(state, require_auth))
}

async fn list_plans(State(state): State<AppState>) -> AppResult<Json<Vec<SubscriptionPlan>>> {
    Ok(Json(state.subscription_service.list_plans(true).await?))
}

async fn get_plan(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<Json<PlanDetail>> {
    Ok(Json(state.subscription_service.plan_detail(id, true).await?))
}

async fn my_subscriptions(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> AppResult<Json<Vec<SubscriptionView>>> {
    Ok(Json(state.subscription_service.list_for_user(user.id, false).await?))
}

async fn my_active_subscriptions(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> AppResult<Json<Vec<SubscriptionView>>> {
    Ok(Json(state.subscription_service.list_for_user(user.id, true).await?))
}

async fn purchase(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(body): Json<PurchaseRequest>,
) -> AppResult<(StatusCode, Json<Payment>)> {
    let payment = state
        .billing_service
        .create_payment(
            user.id,
            body.subscription_plan_id,
            body.selected_services,
            body.payment_method,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

async fn update_services(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
    Json(body): Json<SelectionRequest>,
) -> AppResult<Json<SubscriptionView>> {
    let view = state
        .subscription_service
        .update_selected_services(id, user.id, body.selected_services)
        .await?;
    Ok(Json(view))
}

async fn cancel(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<SubscriptionView>> {
    Ok(Json(state.subscription_service.cancel(id, user.id).await?))
}

async fn my_stats(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> AppResult<Json<UserSubscriptionStats>> {
    Ok(Json(state.subscription_service.user_stats(user.id).await?))
}

async fn admin_list_plans(State(state): State<AppState>) -> AppResult<Json<Vec<SubscriptionPlan>>> {
    Ok(Json(state.subscription_service.list_plans(false).await?))
}

async fn create_plan(
    State(state): State<AppState>,
    Json(input): Json<PlanInput>,
) -> AppResult<(StatusCode, Json<SubscriptionPlan>)> {
    let plan = state.subscription_service.create_plan(input).await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

async fn admin_get_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<PlanDetail>> {
    Ok(Json(state.subscription_service.plan_detail(id, false).await?))
}

async fn update_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<PlanInput>,
) -> AppResult<Json<SubscriptionPlan>> {
    Ok(Json(state.subscription_service.update_plan(id, input).await?))
}

async fn delete_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    let outcome = state.subscription_service.remove_plan(id).await?;
    Ok(Json(json!({ "result": outcome })))
}

async fn admin_subscriptions(
    State(state): State<AppState>,
    Query(query): Query<SubscriptionQuery>,
) -> AppResult<Json<Vec<SubscriptionView>>> {
    let views = state
        .subscription_service
        .list_all(query.active, Page::new(query.limit, query.offset))
        .await?;
    Ok(Json(views))
}

async fn admin_stats(State(state): State<AppState>) -> AppResult<Json<AdminSubscriptionStats>> {
    Ok(Json(state.subscription_service.admin_stats().await?))
}
