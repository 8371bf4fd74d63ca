use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::config::ExtractorKind;

pub mod http_form;
pub mod static_session;

pub use http_form::HttpFormExtractor;
pub use static_session::StaticExtractor;

/// Credentials and site details for one login attempt.
#[derive(Debug, Clone)]
pub struct LoginRequest<'a> {
    pub login_url: &'a str,
    pub username: &'a str,
    pub password: &'a str,
    /// `additional_credentials` of the login service.
    pub options: &'a serde_json::Value,
}

impl LoginRequest<'_> {
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractedSession {
    pub cookies: serde_json::Map<String, serde_json::Value>,
    pub session_id: Option<String>,
    /// Earliest expiry the site announced, if any.
    pub expires_at: Option<DateTime<Utc>>,
}

const SESSION_COOKIE_NAMES: &[&str] = &["sessionid", "session_id", "session", "sid", "PHPSESSID"];

/// Width of the `cookies.session_id` column.
pub const MAX_SESSION_ID_LEN: usize = 255;

impl ExtractedSession {
    /// Identifier stored with the cookie: the extractor's own, a well-known
    /// session cookie, or a digest of the cookie set. Values too long for the
    /// column are replaced by the digest.
    pub fn resolved_session_id(&self) -> String {
        let named = self.session_id.as_deref().filter(|id| !id.is_empty()).or_else(|| {
            SESSION_COOKIE_NAMES
                .iter()
                .filter_map(|name| self.cookies.get(*name).and_then(|v| v.as_str()))
                .find(|value| !value.is_empty())
        });
        match named {
            Some(id) if id.chars().count() <= MAX_SESSION_ID_LEN => id.to_string(),
            _ => self.digest(),
        }
    }

    fn digest(&self) -> String {
        let digest = Sha256::digest(serde_json::Value::Object(self.cookies.clone()).to_string());
        hex::encode(digest)[..32].to_string()
    }

    /// Stored expiry: the site's own if it comes first, otherwise `now + ttl`.
    pub fn resolved_expiry(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> DateTime<Utc> {
        let fallback = now + ttl;
        match self.expires_at {
            Some(site) if site > now && site < fallback => site,
            _ => fallback,
        }
    }
}

#[async_trait]
pub trait CookieExtractor: Send + Sync {
    /// Logs in and returns the authenticated session cookies.
    async fn extract(&self, request: &LoginRequest<'_>) -> Result<ExtractedSession>;

    fn name(&self) -> &str;
}

pub fn build_extractor(kind: ExtractorKind, timeout: Duration) -> Arc<dyn CookieExtractor> {
    match kind {
        ExtractorKind::Http => Arc::new(HttpFormExtractor::new(timeout)),
        ExtractorKind::Static => Arc::new(StaticExtractor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session(cookies: serde_json::Value) -> ExtractedSession {
        ExtractedSession {
            cookies: cookies.as_object().cloned().unwrap_or_default(),
            ..Default::default()
        }
    }

    #[test]
    fn session_id_prefers_known_cookie_names() {
        let s = session(json!({ "theme": "dark", "sid": "abc123" }));
        assert_eq!(s.resolved_session_id(), "abc123");
    }

    #[test]
    fn session_id_falls_back_to_digest() {
        let s = session(json!({ "token": "xyz" }));
        let id = s.resolved_session_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, session(json!({ "token": "xyz" })).resolved_session_id());
    }

    #[test]
    fn oversized_session_values_fall_back_to_digest() {
        let jwt = "e".repeat(400);
        let s = session(json!({ "sessionid": jwt }));
        let id = s.resolved_session_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

        let mut own = session(json!({ "token": "xyz" }));
        own.session_id = Some("x".repeat(MAX_SESSION_ID_LEN + 1));
        assert_eq!(own.resolved_session_id().len(), 32);

        own.session_id = Some("x".repeat(MAX_SESSION_ID_LEN));
        assert_eq!(own.resolved_session_id().len(), MAX_SESSION_ID_LEN);
    }

    #[test]
    fn expiry_never_exceeds_the_configured_ttl() {
        let now = Utc::now();
        let ttl = chrono::Duration::hours(24);
        let mut s = session(json!({}));
        assert_eq!(s.resolved_expiry(now, ttl), now + ttl);

        s.expires_at = Some(now + chrono::Duration::hours(2));
        assert_eq!(s.resolved_expiry(now, ttl), now + chrono::Duration::hours(2));

        s.expires_at = Some(now + chrono::Duration::days(30));
        assert_eq!(s.resolved_expiry(now, ttl), now + ttl);

        s.expires_at = Some(now - chrono::Duration::hours(1));
        assert_eq!(s.resolved_expiry(now, ttl), now + ttl);
    }
}
