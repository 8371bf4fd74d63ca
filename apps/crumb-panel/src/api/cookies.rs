use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    routing::{get, post},
};
use crumb_db::models::access::{
    LoginService, LoginServiceInput, LoginServiceUpdate, UserService, UserServiceStatus,
};
use crumb_db::models::cookie::{
    Cookie, CookieExtractionJob, CookieInjectionLog, CookieStatus, InjectionStatus, JobStatus,
    ValidationSummary,
};
use crumb_db::models::user::User;
use crumb_db::repositories::Page;
use crumb_db::repositories::user_service_repo::AssignmentFilter;
use serde::Deserialize;
use uuid::Uuid;

use crate::AppState;
use crate::api::catalog::AssignmentQuery;
use crate::api::{ListQuery, parse_opt, request_context, require_admin, require_auth};
use crate::error::AppResult;
use crate::services::analytics_service::CookieManagementStats;
use crate::services::cookie_service::ServedCookie;
use crate::services::monitoring::{CleanupSummary, Retention};

#[derive(Deserialize)]
pub struct AccessRequest {
    pub service: Uuid,
}

#[derive(Deserialize)]
pub struct LoginServiceQuery {
    pub service_id: Option<Uuid>,
    pub is_active: Option<bool>,
}

#[derive(Deserialize, Default)]
pub struct ApproveRequest {
    pub login_service_id: Option<Uuid>,
}

#[derive(Deserialize)]
pub struct CookieQuery {
    pub status: Option<String>,
    pub service_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Deserialize)]
pub struct CookieStatusUpdate {
    pub status: String,
}

#[derive(Deserialize)]
pub struct ExtractRequest {
    pub login_service_id: Uuid,
}

#[derive(Deserialize)]
pub struct JobQuery {
    pub status: Option<String>,
    pub login_service_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Deserialize)]
pub struct ActivityQuery {
    pub status: Option<String>,
    pub user_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct CleanupRequest {
    pub cookie_retention_days: Option<i64>,
    pub log_retention_days: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct ValidateRequest {
    pub cookie_ids: Option<Vec<Uuid>>,
}

pub fn routes(state: AppState) -> Router<AppState> {
    let admin = Router::new()
        .route("/admin/login-services", get(list_login_services).post(create_login_service))
        .route(
            "/admin/login-services/{id}",
            get(get_login_service)
                .put(update_login_service)
                .delete(delete_login_service),
        )
        .route("/admin/pending-requests", get(pending_requests))
        .route("/admin/approve-request/{id}", post(approve_request))
        .route("/admin/reject-request/{id}", post(reject_request))
        .route("/admin/user-services", get(admin_user_services))
        .route("/admin/user-services/{id}/deactivate", post(deactivate_user_service))
        .route("/admin/user-services/{id}/suspend", post(suspend_user_service))
        .route("/admin/user-services/{id}/reinstate", post(reinstate_user_service))
        .route("/admin/cookies", get(list_cookies))
        .route(
            "/admin/cookies/{id}",
            get(get_cookie).patch(update_cookie_status).delete(delete_cookie),
        )
        .route("/admin/extract-cookies", post(extract_cookies))
        .route("/admin/extraction-jobs", get(list_jobs))
        .route("/admin/extraction-jobs/{id}", get(get_job))
        .route("/admin/extraction-jobs/{id}/cancel", post(cancel_job))
        .route("/admin/cookie-activity", get(cookie_activity))
        .route("/admin/stats", get(admin_stats))
        .route("/admin/validate-cookies", post(validate_cookies))
        .route("/admin/cleanup", post(cleanup))
        .route_layer(middleware::from_fn(require_admin));

    Router::new()
        .route("/request-access", post(request_access))
        .route("/my-services", get(my_services))
        .route("/my-history", get(my_history))
        .route("/my-activity", get(my_activity))
        .route("/service/{service_id}/cookie", get(fetch_cookie))
        .merge(admin)
        .route_layer(middleware::from_fn_with_state(state, require_auth))
}

async fn request_access(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(body): Json<AccessRequest>,
) -> AppResult<(StatusCode, Json<UserService>)> {
    let assignment = state.access_service.request_access(user.id, body.service).await?;
    Ok((StatusCode::CREATED, Json(assignment)))
}

async fn my_services(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<UserService>>> {
    let assignments = state
        .access_service
        .user_assignments(user.id, Some(UserServiceStatus::Active), query.page())
        .await?;
    Ok(Json(assignments))
}

async fn my_history(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<UserService>>> {
    let assignments = state
        .access_service
        .user_assignments(user.id, None, query.page())
        .await?;
    Ok(Json(assignments))
}

async fn my_activity(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<CookieInjectionLog>>> {
    let logs = state
        .cookie_service
        .activity(None, Some(user.id), query.page())
        .await?;
    Ok(Json(logs))
}

async fn fetch_cookie(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(service_id): Path<Uuid>,
    headers: HeaderMap,
) -> AppResult<Json<ServedCookie>> {
    let served = state
        .cookie_service
        .fetch_for_user(user.id, service_id, &request_context(&headers))
        .await?;
    Ok(Json(served))
}

async fn list_login_services(
    State(state): State<AppState>,
    Query(query): Query<LoginServiceQuery>,
) -> AppResult<Json<Vec<LoginService>>> {
    let services = state
        .access_service
        .login_services(query.service_id, query.is_active)
        .await?;
    Ok(Json(services))
}

async fn create_login_service(
    State(state): State<AppState>,
    Json(input): Json<LoginServiceInput>,
) -> AppResult<(StatusCode, Json<LoginService>)> {
    let created = state.access_service.create_login_service(input).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_login_service(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<LoginService>> {
    Ok(Json(state.access_service.login_service(id).await?))
}

async fn update_login_service(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<LoginServiceUpdate>,
) -> AppResult<Json<LoginService>> {
    Ok(Json(state.access_service.update_login_service(id, update).await?))
}

async fn delete_login_service(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state.access_service.delete_login_service(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pending_requests(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<UserService>>> {
    let filter = AssignmentFilter {
        status: Some(UserServiceStatus::Pending),
        ..Default::default()
    };
    Ok(Json(state.access_service.list(filter, query.page()).await?))
}

async fn approve_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ApproveRequest>>,
) -> AppResult<Json<UserService>> {
    let Json(body) = body.unwrap_or_default();
    Ok(Json(state.access_service.approve(id, body.login_service_id).await?))
}

async fn reject_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<UserService>> {
    Ok(Json(state.access_service.reject(id).await?))
}

async fn admin_user_services(
    State(state): State<AppState>,
    Query(query): Query<AssignmentQuery>,
) -> AppResult<Json<Vec<UserService>>> {
    let filter = AssignmentFilter {
        status: parse_opt(query.status.as_deref())?,
        service_id: query.service_id,
        user_id: query.user_id,
    };
    let assignments = state
        .access_service
        .list(filter, Page::new(query.limit, query.offset))
        .await?;
    Ok(Json(assignments))
}

async fn deactivate_user_service(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<UserService>> {
    Ok(Json(state.access_service.deactivate(id).await?))
}

async fn suspend_user_service(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<UserService>> {
    Ok(Json(state.access_service.suspend(id).await?))
}

async fn reinstate_user_service(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<UserService>> {
    Ok(Json(state.access_service.reinstate(id).await?))
}

async fn list_cookies(
    State(state): State<AppState>,
    Query(query): Query<CookieQuery>,
) -> AppResult<Json<Vec<Cookie>>> {
    let status = parse_opt::<CookieStatus>(query.status.as_deref())?;
    let cookies = state
        .cookie_service
        .list(status, query.service_id, Page::new(query.limit, query.offset))
        .await?;
    Ok(Json(cookies))
}

async fn get_cookie(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<Json<Cookie>> {
    Ok(Json(state.cookie_service.get(id).await?))
}

async fn update_cookie_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CookieStatusUpdate>,
) -> AppResult<Json<Cookie>> {
    let status: CookieStatus = body.status.parse()?;
    Ok(Json(state.cookie_service.set_status(id, status).await?))
}

async fn delete_cookie(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<StatusCode> {
    state.cookie_service.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn extract_cookies(
    State(state): State<AppState>,
    Json(body): Json<ExtractRequest>,
) -> AppResult<(StatusCode, Json<CookieExtractionJob>)> {
    let job = state.extraction_service.start_job(body.login_service_id).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobQuery>,
) -> AppResult<Json<Vec<CookieExtractionJob>>> {
    let status = parse_opt::<JobStatus>(query.status.as_deref())?;
    let jobs = state
        .extraction_service
        .list(status, query.login_service_id, Page::new(query.limit, query.offset))
        .await?;
    Ok(Json(jobs))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<CookieExtractionJob>> {
    Ok(Json(state.extraction_service.get(id).await?))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<CookieExtractionJob>> {
    Ok(Json(state.extraction_service.cancel(id).await?))
}

async fn cookie_activity(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> AppResult<Json<Vec<CookieInjectionLog>>> {
    let status = parse_opt::<InjectionStatus>(query.status.as_deref())?;
    let logs = state
        .cookie_service
        .activity(status, query.user_id, Page::new(query.limit, query.offset))
        .await?;
    Ok(Json(logs))
}

async fn admin_stats(State(state): State<AppState>) -> AppResult<Json<CookieManagementStats>> {
    Ok(Json(state.analytics_service.cookie_management_stats().await?))
}

async fn validate_cookies(
    State(state): State<AppState>,
    body: Option<Json<ValidateRequest>>,
) -> AppResult<Json<ValidationSummary>> {
    let Json(body) = body.unwrap_or_default();
    let summary = state
        .cookie_service
        .validate(body.cookie_ids.as_deref())
        .await?;
    Ok(Json(summary))
}

async fn cleanup(
    State(state): State<AppState>,
    body: Option<Json<CleanupRequest>>,
) -> AppResult<Json<CleanupSummary>> {
    let Json(body) = body.unwrap_or_default();
    let retention = Retention::resolve(
        body.cookie_retention_days,
        body.log_retention_days,
        state.monitoring.default_retention(),
    )?;
    Ok(Json(state.monitoring.cleanup(retention).await?))
}
