use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
};
use crumb_db::models::payment::{Payment, PaymentMethod, PaymentStatus, PaymentTotals};
use crumb_db::models::user::User;
use crumb_db::repositories::Page;
use serde::Deserialize;
use uuid::Uuid;

use crate::AppState;
use crate::api::{ListQuery, parse_opt, require_admin, require_auth};
use crate::error::AppResult;
use crate::services::billing_service::{GatewayResult, PaymentStats, ProcessedPayment};

#[derive(Deserialize)]
pub struct CreatePaymentRequest {
    pub subscription_plan_id: Uuid,
    #[serde(default)]
    pub selected_services: Vec<Uuid>,
    #[serde(default)]
    pub payment_method: PaymentMethod,
}

#[derive(Deserialize)]
pub struct ProcessPaymentRequest {
    pub payment_id: Uuid,
    pub payment_status: String,
    pub external_transaction_id: Option<String>,
    pub gateway_response: Option<serde_json::Value>,
}

#[derive(Deserialize)]
pub struct RefundRequest {
    pub payment_id: Uuid,
    pub refund_reason: Option<String>,
    pub refund_amount_cents: Option<i64>,
}

#[derive(Deserialize)]
pub struct PaymentQuery {
    pub status: Option<String>,
    pub method: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub fn routes(state: AppState) -> Router<AppState> {
    let admin = Router::new()
        .route("/admin/payments", get(admin_payments))
        .route("/admin/payments/{id}", get(admin_payment))
        .route("/admin/refund", post(refund))
        .route("/admin/stats", get(admin_stats))
        .route_layer(middleware::from_fn(require_admin));

    Router::new()
        .route("/create", post(create_payment))
        .route("/process", post(process_payment))
        .route("/my-payments", get(my_payments))
        .route("/my-payments/{id}", get(my_payment))
        .route("/my-stats", get(my_stats))
        .merge(admin)
        .route_layer(middleware::from_fn_with_state(state, require_auth))
}

async fn create_payment(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(body): Json<CreatePaymentRequest>,
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

async fn process_payment(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(body): Json<ProcessPaymentRequest>,
) -> AppResult<Json<ProcessedPayment>> {
    let status: PaymentStatus = body.payment_status.parse()?;
    let processed = state
        .billing_service
        .process(
            user.id,
            body.payment_id,
            GatewayResult {
                status,
                external_transaction_id: body.external_transaction_id,
                gateway_response: body.gateway_response,
            },
        )
        .await?;
    Ok(Json(processed))
}

async fn my_payments(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<Payment>>> {
    Ok(Json(state.billing_service.user_payments(user.id, query.page()).await?))
}

async fn my_payment(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Payment>> {
    Ok(Json(state.billing_service.user_payment(user.id, id).await?))
}

async fn my_stats(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> AppResult<Json<PaymentTotals>> {
    Ok(Json(state.billing_service.user_stats(user.id).await?))
}

async fn admin_payments(
    State(state): State<AppState>,
    Query(query): Query<PaymentQuery>,
) -> AppResult<Json<Vec<Payment>>> {
    let status = parse_opt::<PaymentStatus>(query.status.as_deref())?;
    let method = parse_opt::<PaymentMethod>(query.method.as_deref())?;
    let payments = state
        .billing_service
        .list_all(status, method, Page::new(query.limit, query.offset))
        .await?;
    Ok(Json(payments))
}

async fn admin_payment(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<Json<Payment>> {
    Ok(Json(state.billing_service.get(id).await?))
}

async fn refund(
    State(state): State<AppState>,
    Json(body): Json<RefundRequest>,
) -> AppResult<Json<Payment>> {
    let payment = state
        .billing_service
        .refund(body.payment_id, body.refund_reason, body.refund_amount_cents)
        .await?;
    Ok(Json(payment))
}

async fn admin_stats(State(state): State<AppState>) -> AppResult<Json<PaymentStats>> {
    Ok(Json(state.billing_service.admin_stats().await?))
}
