use anyhow::{Result, bail};
use async_trait::async_trait;
use rand::Rng;
use serde_json::json;

use super::{CookieExtractor, ExtractedSession, LoginRequest};

/// Synthesizes a session without contacting the site.
pub struct StaticExtractor;

fn random_token() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    hex::encode(bytes)
}

#[async_trait]
impl CookieExtractor for StaticExtractor {
    async fn extract(&self, request: &LoginRequest<'_>) -> Result<ExtractedSession> {
        if request.username.is_empty() || request.password.is_empty() {
            bail!("Login service has no usable credentials");
        }

        let session = random_token();
        let cookies = json!({
            "sessionid": session,
            "csrftoken": random_token(),
            "user": request.username,
        });

        Ok(ExtractedSession {
            cookies: cookies.as_object().cloned().unwrap_or_default(),
            session_id: Some(session),
            expires_at: None,
        })
    }

    fn name(&self) -> &str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn synthesizes_a_fresh_session_each_time() {
        let options = json!({});
        let request = LoginRequest {
            login_url: "https://example.com/login",
            username: "shared@example.com",
            password: "secret",
            options: &options,
        };
        let first = StaticExtractor.extract(&request).await.unwrap();
        let second = StaticExtractor.extract(&request).await.unwrap();
        assert_eq!(first.cookies["user"], "shared@example.com");
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(first.resolved_session_id(), first.cookies["sessionid"].as_str().unwrap());
    }

    #[tokio::test]
    async fn refuses_empty_credentials() {
        let options = json!({});
        let request = LoginRequest {
            login_url: "https://example.com/login",
            username: "",
            password: "secret",
            options: &options,
        };
        assert!(StaticExtractor.extract(&request).await.is_err());
    }
}
