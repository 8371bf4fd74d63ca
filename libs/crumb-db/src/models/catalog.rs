use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::text_enum;

text_enum! {
    pub enum ServiceCategory : "service category" {
        AiChat => "ai_chat",
        AiImage => "ai_image",
        Seo => "seo",
        Analytics => "analytics",
        Writing => "writing",
        SocialMedia => "social_media",
        Design => "design",
        Other => "other",
    }
}

impl ServiceCategory {
    pub fn display_name(&self) -> &'static str {
        match self {
            ServiceCategory::AiChat => "AI Chat",
            ServiceCategory::AiImage => "AI Image",
            ServiceCategory::Seo => "SEO Tools",
            ServiceCategory::Analytics => "Analytics",
            ServiceCategory::Writing => "Writing Tools",
            ServiceCategory::SocialMedia => "Social Media",
            ServiceCategory::Design => "Design Tools",
            ServiceCategory::Other => "Other",
        }
    }
}

impl Default for ServiceCategory {
    fn default() -> Self {
        ServiceCategory::Other
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Service {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub login_url: String,
    pub description: String,
    pub logo_url: Option<String>,
    #[sqlx(try_from = "String")]
    pub category: ServiceCategory,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields accepted when creating or replacing a catalog entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceInput {
    pub name: String,
    pub display_name: String,
    pub login_url: String,
    #[serde(default)]
    pub description: String,
    pub logo_url: Option<String>,
    #[serde(default)]
    pub category: ServiceCategory,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct CategoryCount {
    pub category: String,
    pub service_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips_through_text() {
        for category in ServiceCategory::ALL {
            let parsed: ServiceCategory = category.as_str().parse().unwrap();
            assert_eq!(parsed, *category);
        }
    }

    #[test]
    fn unknown_category_is_rejected() {
        let err = "crypto_tools".parse::<ServiceCategory>().unwrap_err();
        assert_eq!(err.value, "crypto_tools");
        assert!(err.to_string().contains("service category"));
    }

    #[test]
    fn service_input_defaults_category_and_activity() {
        let input: ServiceInput = serde_json::from_str(
            r#"{"name":"gpt","display_name":"GPT","login_url":"https://chat.example.com/login"}"#,
        )
        .unwrap();
        assert_eq!(input.category, ServiceCategory::Other);
        assert!(input.is_active);
        assert!(input.description.is_empty());
    }
}
