use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    routing::{get, post},
};
use crumb_db::models::access::UserService;
use crumb_db::models::catalog::{Service, ServiceCategory, ServiceInput};
use crumb_db::models::user::User;
use crumb_db::repositories::Page;
use crumb_db::repositories::user_service_repo::AssignmentFilter;
use serde::Deserialize;
use uuid::Uuid;

use crate::AppState;
use crate::api::{ListQuery, parse_opt, request_context, require_admin, require_auth};
use crate::error::AppResult;
use crate::services::catalog_service::{CategorySummary, ServiceStats};
use crate::services::cookie_service::ServedCookie;

#[derive(Deserialize)]
pub struct ServiceQuery {
    pub category: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Deserialize)]
pub struct AssignmentQuery {
    pub status: Option<String>,
    pub service_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub fn routes(state: AppState) -> Router<AppState> {
    let admin = Router::new()
        .route("/admin/services", get(admin_list_services).post(create_service))
        .route(
            "/admin/services/{id}",
            get(admin_get_service).put(update_service).delete(delete_service),
        )
        .route("/admin/user-services", get(admin_user_services))
        .route("/admin/stats", get(all_stats))
        .route("/admin/stats/{service_id}", get(service_stats))
        .route_layer(middleware::from_fn(require_admin));

    Router::new()
        .route("/services", get(list_services))
        .route("/services/{id}", get(get_service))
        .route("/categories", get(categories))
        .route("/user/accessible-services", get(accessible_services))
        .route("/user/service-status", get(service_status))
        .route("/services/{service_id}/request-access", post(request_access))
        .route("/services/{service_id}/cookie", get(fetch_cookie))
        .merge(admin)
        .route_layer(middleware::from_fn_with_state(state, require_auth))
}

async fn list_services(
    State(state): State<AppState>,
    Query(query): Query<ServiceQuery>,
) -> AppResult<Json<Vec<Service>>> {
    let category = parse_opt::<ServiceCategory>(query.category.as_deref())?;
    let services = state
        .catalog_service
        .list(true, category, Page::new(query.limit, query.offset))
        .await?;
    Ok(Json(services))
}

async fn get_service(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<Json<Service>> {
    Ok(Json(state.catalog_service.get(id, true).await?))
}

async fn categories(State(state): State<AppState>) -> AppResult<Json<Vec<CategorySummary>>> {
    Ok(Json(state.catalog_service.categories().await?))
}

async fn accessible_services(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> AppResult<Json<Vec<Service>>> {
    Ok(Json(state.catalog_service.accessible_for_user(user.id).await?))
}

async fn service_status(
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

async fn request_access(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(service_id): Path<Uuid>,
) -> AppResult<(StatusCode, Json<UserService>)> {
    let assignment = state.access_service.request_access(user.id, service_id).await?;
    Ok((StatusCode::CREATED, Json(assignment)))
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

async fn admin_list_services(
    State(state): State<AppState>,
    Query(query): Query<ServiceQuery>,
) -> AppResult<Json<Vec<Service>>> {
    let category = parse_opt::<ServiceCategory>(query.category.as_deref())?;
    let services = state
        .catalog_service
        .list(false, category, Page::new(query.limit, query.offset))
        .await?;
    Ok(Json(services))
}

async fn create_service(
    State(state): State<AppState>,
    Json(input): Json<ServiceInput>,
) -> AppResult<(StatusCode, Json<Service>)> {
    let service = state.catalog_service.create(input).await?;
    Ok((StatusCode::CREATED, Json(service)))
}

async fn admin_get_service(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Service>> {
    Ok(Json(state.catalog_service.get(id, false).await?))
}

async fn update_service(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<ServiceInput>,
) -> AppResult<Json<Service>> {
    Ok(Json(state.catalog_service.update(id, input).await?))
}

async fn delete_service(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<StatusCode> {
    state.catalog_service.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
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

async fn all_stats(State(state): State<AppState>) -> AppResult<Json<Vec<ServiceStats>>> {
    Ok(Json(state.catalog_service.all_stats().await?))
}

async fn service_stats(
    State(state): State<AppState>,
    Path(service_id): Path<Uuid>,
) -> AppResult<Json<ServiceStats>> {
    Ok(Json(state.catalog_service.stats(service_id).await?))
}
