use anyhow::{Context, Result, bail};
use crumb_db::models::catalog::{ServiceCategory, ServiceInput};
use crumb_db::models::plan::PlanInput;
use crumb_db::models::user::normalize_email;
use crumb_db::repositories::plan_repo::PlanRepository;
use crumb_db::repositories::service_repo::ServiceRepository;
use crumb_db::repositories::user_repo::UserRepository;
use sqlx::PgPool;
use tracing::info;

use crate::services::user_service::MIN_PASSWORD_LEN;

fn hash_password(password: &str) -> Result<String> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        bail!("Password must be at least {MIN_PASSWORD_LEN} characters");
    }
    bcrypt::hash(password, bcrypt::DEFAULT_COST).context("Failed to hash password")
}

pub async fn create_superuser(pool: &PgPool, email: &str, full_name: &str, password: &str) -> Result<()> {
    let hash = hash_password(password)?;
    let email = normalize_email(email);
    let user = UserRepository::new(pool.clone())
        .upsert_superuser(&email, full_name, &hash)
        .await?;
    println!("Superuser '{}' is ready (id {}).", user.email, user.id);
    Ok(())
}

pub async fn reset_password(pool: &PgPool, email: &str, new_pass: &str) -> Result<()> {
    let hash = hash_password(new_pass)?;
    let email = normalize_email(email);
    if !UserRepository::new(pool.clone()).set_password(&email, &hash).await? {
        bail!("No user with email '{}'", email);
    }
    println!("Password for '{}' has been reset.", email);
    Ok(())
}

struct DemoService {
    name: &'static str,
    display_name: &'static str,
    login_url: &'static str,
    description: &'static str,
    category: ServiceCategory,
}

const DEMO_SERVICES: &[DemoService] = &[
    DemoService {
        name: "chatgpt",
        display_name: "ChatGPT Plus",
        login_url: "https://chat.openai.com/auth/login",
        description: "Advanced AI chatbot with GPT-4 access",
        category: ServiceCategory::AiChat,
    },
    DemoService {
        name: "claude",
        display_name: "Claude Pro",
        login_url: "https://claude.ai/login",
        description: "Advanced AI assistant",
        category: ServiceCategory::AiChat,
    },
    DemoService {
        name: "midjourney",
        display_name: "Midjourney",
        login_url: "https://www.midjourney.com/auth",
        description: "AI-powered image generation tool",
        category: ServiceCategory::AiImage,
    },
    DemoService {
        name: "semrush",
        display_name: "SEMrush",
        login_url: "https://www.semrush.com/auth/",
        description: "SEO and marketing toolkit",
        category: ServiceCategory::Seo,
    },
    DemoService {
        name: "ahrefs",
        display_name: "Ahrefs",
        login_url: "https://ahrefs.com/auth/login",
        description: "SEO toolset for professionals",
        category: ServiceCategory::Seo,
    },
    DemoService {
        name: "jasper",
        display_name: "Jasper AI",
        login_url: "https://app.jasper.ai/login",
        description: "AI writing assistant for content creation",
        category: ServiceCategory::Writing,
    },
    DemoService {
        name: "canva_pro",
        display_name: "Canva Pro",
        login_url: "https://www.canva.com/login",
        description: "Professional design platform",
        category: ServiceCategory::Design,
    },
];

/// (name, description, price in cents, days, max services)
const DEMO_PLANS: &[(&str, &str, i64, i32, i32)] = &[
    ("Individual Plan", "Access to 1 premium tool of your choice", 999, 30, 1),
    ("5-Service Pack", "Access to 5 premium tools of your choice", 2999, 30, 5),
    ("Premium Pack", "Access to every premium tool available", 7999, 30, 15),
    ("Quarterly Premium", "Every tool for 3 months", 19999, 90, 20),
];

/// Inserts the demo catalog and plans. Existing rows are left untouched.
pub async fn seed(pool: &PgPool) -> Result<()> {
    let services = ServiceRepository::new(pool.clone());
    let plans = PlanRepository::new(pool.clone());

    let mut service_ids = Vec::with_capacity(DEMO_SERVICES.len());
    for demo in DEMO_SERVICES {
        let input = ServiceInput {
            name: demo.name.to_string(),
            display_name: demo.display_name.to_string(),
            login_url: demo.login_url.to_string(),
            description: demo.description.to_string(),
            logo_url: None,
            category: demo.category,
            is_active: true,
        };
        match services.create(&input).await? {
            Some(service) => {
                info!("Created service {}", service.display_name);
                service_ids.push(service.id);
            }
            None => {
                let existing = services
                    .get_by_name(demo.name)
                    .await?
                    .with_context(|| format!("Service '{}' vanished during seeding", demo.name))?;
                service_ids.push(existing.id);
            }
        }
    }

    let existing: Vec<String> = plans.list(false).await?.into_iter().map(|p| p.name).collect();
    for (name, description, price_cents, duration_days, max_services) in DEMO_PLANS {
        if existing.iter().any(|n| n == name) {
            continue;
        }
        let plan = plans
            .create(&PlanInput {
                name: name.to_string(),
                description: description.to_string(),
                price_cents: *price_cents,
                duration_days: *duration_days,
                max_services: *max_services,
                service_ids: service_ids.clone(),
                is_active: true,
            })
            .await?;
        info!("Created plan {}", plan.name);
    }

    println!(
        "Seeded {} services and {} plans.",
        DEMO_SERVICES.len(),
        DEMO_PLANS.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::catalog_service::validate_input;

    #[test]
    fn short_passwords_are_refused_before_hashing() {
        assert!(hash_password("short").is_err());
    }

    #[test]
    fn demo_catalog_passes_validation() {
        for demo in DEMO_SERVICES {
            let input = ServiceInput {
                name: demo.name.to_string(),
                display_name: demo.display_name.to_string(),
                login_url: demo.login_url.to_string(),
                description: demo.description.to_string(),
                logo_url: None,
                category: demo.category,
                is_active: true,
            };
            assert!(validate_input(input).is_ok(), "{}", demo.name);
        }
    }
}
