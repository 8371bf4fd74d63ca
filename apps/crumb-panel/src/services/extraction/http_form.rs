use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::SET_COOKIE;
use tracing::debug;
use url::Url;

use super::{CookieExtractor, ExtractedSession, LoginRequest};

/// Posts the login form and keeps whatever cookies the site sets.
///
/// `additional_credentials` may override the form shape:
/// `username_field`, `password_field`, `form_action` (relative to the login
/// URL) and `extra_fields` (an object of string values).
pub struct HttpFormExtractor {
    timeout: Duration,
}

impl HttpFormExtractor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

pub(crate) fn login_form(request: &LoginRequest<'_>) -> HashMap<String, String> {
    let mut form = HashMap::new();
    if let Some(extra) = request.options.get("extra_fields").and_then(|v| v.as_object()) {
        for (key, value) in extra {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            form.insert(key.clone(), value);
        }
    }
    form.insert(
        request.option("username_field").unwrap_or("username").to_string(),
        request.username.to_string(),
    );
    form.insert(
        request.option("password_field").unwrap_or("password").to_string(),
        request.password.to_string(),
    );
    form
}

/// Expiry announced by one `Set-Cookie` header. Max-Age wins over Expires.
pub(crate) fn cookie_expiry(header: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut expires = None;
    for attr in header.split(';').skip(1) {
        let Some((key, value)) = attr.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "max-age" => {
                // Out-of-range values are ignored rather than clamped.
                return value
                    .parse::<i64>()
                    .ok()
                    .and_then(TimeDelta::try_seconds)
                    .and_then(|age| now.checked_add_signed(age));
            }
            "expires" => {
                expires = DateTime::parse_from_rfc2822(value)
                    .map(|d| d.with_timezone(&Utc))
                    .ok()
                    .or_else(|| {
                        NaiveDateTime::parse_from_str(value, "%a, %d-%b-%Y %H:%M:%S GMT")
                            .ok()
                            .map(|n| n.and_utc())
                    });
            }
            _ => {}
        }
    }
    expires
}

/// Splits a `Cookie` request header value into a name/value map.
pub(crate) fn parse_cookie_header(value: &str) -> serde_json::Map<String, serde_json::Value> {
    value
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, value)| (name.to_string(), serde_json::Value::String(value.to_string())))
        .collect()
}

#[async_trait]
impl CookieExtractor for HttpFormExtractor {
    async fn extract(&self, request: &LoginRequest<'_>) -> Result<ExtractedSession> {
        let login_url = Url::parse(request.login_url).context("Invalid login URL")?;
        let action = match request.option("form_action") {
            Some(path) => login_url.join(path).context("Invalid form_action")?,
            None => login_url.clone(),
        };

        let jar = Arc::new(Jar::default());
        let client = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .timeout(self.timeout)
            .build()
            .context("Failed to build HTTP client")?;

        // Some sites only accept the form once their pre-login cookies are set.
        client
            .get(login_url.clone())
            .send()
            .await
            .context("Login page is unreachable")?;

        let response = client
            .post(action.clone())
            .form(&login_form(request))
            .send()
            .await
            .context("Login request failed")?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            bail!("Login was rejected with HTTP {}", status.as_u16());
        }

        let now = Utc::now();
        let expires_at = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|h| cookie_expiry(h, now))
            .filter(|at| *at > now)
            .min();

        let mut cookies = serde_json::Map::new();
        for url in [&login_url, &action, response.url()] {
            if let Some(header) = jar.cookies(url) {
                if let Ok(value) = header.to_str() {
                    cookies.extend(parse_cookie_header(value));
                }
            }
        }
        if cookies.is_empty() {
            bail!("Login did not yield any session cookies");
        }

        debug!(host = ?login_url.host_str(), count = cookies.len(), "Captured session cookies");
        Ok(ExtractedSession {
            cookies,
            session_id: None,
            expires_at,
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn form_uses_configured_field_names() {
        let options = json!({
            "username_field": "email",
            "password_field": "pass",
            "extra_fields": { "remember": "1", "step": 2 }
        });
        let request = LoginRequest {
            login_url: "https://example.com/login",
            username: "shared@example.com",
            password: "hunter22",
            options: &options,
        };
        let form = login_form(&request);
        assert_eq!(form["email"], "shared@example.com");
        assert_eq!(form["pass"], "hunter22");
        assert_eq!(form["remember"], "1");
        assert_eq!(form["step"], "2");
        assert!(!form.contains_key("username"));
    }

    #[test]
    fn credentials_override_extra_fields() {
        let options = json!({ "extra_fields": { "username": "ignored" } });
        let request = LoginRequest {
            login_url: "https://example.com/login",
            username: "real",
            password: "pw",
            options: &options,
        };
        assert_eq!(login_form(&request)["username"], "real");
    }

    #[test]
    fn max_age_takes_precedence_over_expires() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let header = "sid=abc; Expires=Wed, 21 Oct 2015 07:28:00 GMT; Max-Age=3600; Path=/";
        assert_eq!(cookie_expiry(header, now), Some(now + chrono::Duration::hours(1)));
    }

    #[test]
    fn oversized_max_age_is_ignored() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(cookie_expiry("sid=abc; Max-Age=10000000000000000", now), None);
        assert_eq!(cookie_expiry("sid=abc; Max-Age=9000000000000", now), None);
        assert_eq!(cookie_expiry("sid=abc; Max-Age=-9223372036854775808", now), None);
        assert_eq!(cookie_expiry("sid=abc; Max-Age=soon", now), None);
    }

    #[test]
    fn expires_attribute_is_parsed() {
        let now = Utc::now();
        let expected = Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap();
        assert_eq!(
            cookie_expiry("sid=abc; Expires=Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(expected)
        );
        assert_eq!(
            cookie_expiry("sid=abc; expires=Wed, 21-Oct-2015 07:28:00 GMT; HttpOnly", now),
            Some(expected)
        );
        assert_eq!(cookie_expiry("sid=abc; Path=/; HttpOnly", now), None);
    }

    #[test]
    fn cookie_header_is_split_into_pairs() {
        let map = parse_cookie_header("sid=abc; theme=dark;  token=a=b");
        assert_eq!(map["sid"], "abc");
        assert_eq!(map["theme"], "dark");
        assert_eq!(map["token"], "a=b");
    }
}
