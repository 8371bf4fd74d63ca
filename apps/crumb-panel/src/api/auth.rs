use axum::{
    Extension, Json, Router,
    extract::{Query, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
};
use crumb_db::models::user::User;
use crumb_db::repositories::Page;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::api::{require_admin, require_auth};
use crate::error::AppResult;

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub full_name: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub access: String,
    pub refresh: String,
    pub user: User,
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh: String,
}

#[derive(Deserialize)]
pub struct LogoutRequest {
    pub refresh_token: String,
}

#[derive(Deserialize)]
pub struct UserSearch {
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub fn routes(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .route("/api/auth/logout", post(logout))
        .route("/api/profile", get(profile))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let admin = Router::new()
        .route("/api/admin/users", get(list_users))
        .route_layer(middleware::from_fn(require_admin))
        .route_layer(middleware::from_fn_with_state(state, require_auth));

    Router::new()
        .route("/api/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/refresh", post(refresh))
        .merge(protected)
        .merge(admin)
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<User>)> {
    let user = state
        .user_service
        .register(&body.email, &body.full_name, &body.password)
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> AppResult<Json<LoginResponse>> {
    let (tokens, user) = state.user_service.login(&body.email, &body.password).await?;
    Ok(Json(LoginResponse {
        access: tokens.access,
        refresh: tokens.refresh,
        user,
    }))
}

async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let access = state.user_service.refresh(&body.refresh).await?;
    Ok(Json(serde_json::json!({ "access": access })))
}

async fn logout(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(body): Json<LogoutRequest>,
) -> AppResult<StatusCode> {
    state.user_service.logout(&body.refresh_token, user.id).await?;
    Ok(StatusCode::RESET_CONTENT)
}

async fn profile(Extension(user): Extension<User>) -> Json<User> {
    Json(user)
}

async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<UserSearch>,
) -> AppResult<Json<Vec<User>>> {
    let page = Page::new(query.limit, query.offset);
    let users = state
        .user_service
        .search(query.search.as_deref().filter(|s| !s.trim().is_empty()), page)
        .await?;
    Ok(Json(users))
}
