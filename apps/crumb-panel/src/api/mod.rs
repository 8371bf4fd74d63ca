use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method, header},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
};
use crumb_db::models::user::User;
use crumb_db::repositories::Page;
use serde::Deserialize;
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};
use tracing::warn;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::services::cookie_service::RequestContext;

pub mod auth;
pub mod catalog;
pub mod cookies;
pub mod payments;
pub mod subscriptions;

const MAX_BODY_BYTES: usize = 1024 * 1024;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(auth::routes(state.clone()))
        .nest("/api/service", catalog::routes(state.clone()))
        .nest("/api/subscription", subscriptions::routes(state.clone()))
        .nest("/api/payment", payments::routes(state.clone()))
        .nest("/api/cookie_management", cookies::routes(state.clone()))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(cors_layer(&state.config.cors_origin_list()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{}'", o);
                None
            }
        })
        .collect();

    if parsed.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(parsed)
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let database = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.pool)
        .await
        .is_ok();
    Json(json!({
        "status": "ok",
        "database": if database { "up" } else { "down" },
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `limit`/`offset` query parameters shared by list endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListQuery {
    pub fn page(&self) -> Page {
        Page::new(self.limit, self.offset)
    }
}

/// Parses an optional status-like query value into its enum.
pub fn parse_opt<T>(value: Option<&str>) -> AppResult<Option<T>>
where
    T: std::str::FromStr,
    AppError: From<T::Err>,
{
    Ok(value
        .filter(|v| !v.is_empty())
        .map(str::parse)
        .transpose()?)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Loads the bearer token's user into the request extensions.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(req.headers())
        .ok_or_else(|| AppError::unauthorized("Authentication credentials were not provided."))?;
    let user = state.user_service.authenticate(token).await?;
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

/// Must run inside `require_auth`.
pub async fn require_admin(req: Request, next: Next) -> Result<Response, AppError> {
    let allowed = match req.extensions().get::<User>() {
        Some(user) if user.has_admin_access() => true,
        Some(user) => {
            warn!(user_id = %user.id, path = %req.uri().path(), "Non-admin hit an admin route");
            false
        }
        None => {
            return Err(AppError::unauthorized(
                "Authentication credentials were not provided.",
            ));
        }
    };
    if !allowed {
        return Err(AppError::forbidden("You do not have permission to perform this action."));
    }
    Ok(next.run(req).await)
}

/// Client address and agent as seen behind a proxy.
pub fn request_context(headers: &HeaderMap) -> RequestContext {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let ip_address = header_str("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header_str("x-real-ip"))
        .map(str::to_string);

    RequestContext {
        ip_address,
        user_agent: header_str("user-agent").map(|ua| ua.chars().take(500).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use sqlx::postgres::PgPoolOptions;
    use tower::ServiceExt;

    fn app() -> Router {
        let config = crate::config::test_config();
        let pool = PgPoolOptions::new()
            .connect_lazy(&config.database_url)
            .unwrap();
        let state = AppState::build(pool, config).unwrap();
        router(state)
    }

    #[test]
    fn forwarded_for_wins_over_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "10.0.0.2".parse().unwrap());
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        headers.insert("user-agent", "curl/8.0".parse().unwrap());
        let ctx = request_context(&headers);
        assert_eq!(ctx.ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(ctx.user_agent.as_deref(), Some("curl/8.0"));

        headers.remove("x-forwarded-for");
        assert_eq!(request_context(&headers).ip_address.as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn bearer_prefix_is_required() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Token abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc"));
    }

    #[test]
    fn unknown_filter_values_are_bad_requests() {
        use crumb_db::models::cookie::CookieStatus;
        assert_eq!(parse_opt::<CookieStatus>(Some("valid")).unwrap(), Some(CookieStatus::Valid));
        assert_eq!(parse_opt::<CookieStatus>(Some("")).unwrap(), None);
        let err = parse_opt::<CookieStatus>(Some("stale")).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn protected_routes_reject_missing_token() {
        for uri in [
            "/api/profile",
            "/api/cookie_management/my-services",
            "/api/subscription/my-subscriptions",
            "/api/payment/admin/payments",
        ] {
            let response = app()
                .oneshot(HttpRequest::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }
    }

    #[tokio::test]
    async fn garbage_token_is_unauthorized() {
        let response = app()
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/profile")
                    .header(header::AUTHORIZATION, "Bearer not-a-jwt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
