use crumb_db::models::catalog::{Service, ServiceCategory, ServiceInput};
use crumb_db::repositories::Page;
use crumb_db::repositories::cookie_repo::CookieRepository;
use crumb_db::repositories::login_service_repo::{LoginServiceRepository, PoolCapacity};
use crumb_db::repositories::service_repo::ServiceRepository;
use crumb_db::repositories::user_service_repo::UserServiceRepository;
use serde::Serialize;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Debug, Serialize)]
pub struct CategorySummary {
    pub category: String,
    pub display_name: String,
    pub service_count: i64,
}

#[derive(Debug, Serialize)]
pub struct ServiceStats {
    pub service_id: Uuid,
    pub service_name: String,
    pub total_users: i64,
    pub active_users: i64,
    pub valid_cookies: i64,
    pub login_services: PoolCapacity,
}

/// Catalog of third-party services.
#[derive(Debug, Clone)]
pub struct CatalogService {
    service_repo: ServiceRepository,
    login_service_repo: LoginServiceRepository,
    user_service_repo: UserServiceRepository,
    cookie_repo: CookieRepository,
}

impl CatalogService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            service_repo: ServiceRepository::new(pool.clone()),
            login_service_repo: LoginServiceRepository::new(pool.clone()),
            user_service_repo: UserServiceRepository::new(pool.clone()),
            cookie_repo: CookieRepository::new(pool),
        }
    }

    pub async fn list(
        &self,
        active_only: bool,
        category: Option<ServiceCategory>,
        page: Page,
    ) -> AppResult<Vec<Service>> {
        Ok(self.service_repo.list(active_only, category, page).await?)
    }

    /// `active_only` hides inactive services as not found.
    pub async fn get(&self, id: Uuid, active_only: bool) -> AppResult<Service> {
        self.service_repo
            .get_by_id(id)
            .await?
            .filter(|s| s.is_active || !active_only)
            .ok_or_else(|| AppError::not_found("Service not found."))
    }

    pub async fn categories(&self) -> AppResult<Vec<CategorySummary>> {
        let counts = self.service_repo.category_counts().await?;
        Ok(counts
            .into_iter()
            .map(|c| {
                let display_name = c
                    .category
                    .parse::<ServiceCategory>()
                    .map(|cat| cat.display_name().to_string())
                    .unwrap_or_else(|_| c.category.clone());
                CategorySummary {
                    category: c.category,
                    display_name,
                    service_count: c.service_count,
                }
            })
            .collect())
    }

    pub async fn accessible_for_user(&self, user_id: Uuid) -> AppResult<Vec<Service>> {
        Ok(self.service_repo.accessible_for_user(user_id).await?)
    }

    pub async fn create(&self, input: ServiceInput) -> AppResult<Service> {
        let input = validate_input(input)?;
        let service = self
            .service_repo
            .create(&input)
            .await?
            .ok_or_else(|| AppError::conflict("A service with this name already exists."))?;
        info!(service_id = %service.id, name = %service.name, "Created service");
        Ok(service)
    }

    pub async fn update(&self, id: Uuid, input: ServiceInput) -> AppResult<Service> {
        let input = validate_input(input)?;
        if let Some(existing) = self.service_repo.get_by_name(&input.name).await? {
            if existing.id != id {
                return Err(AppError::conflict("A service with this name already exists."));
            }
        }
        self.service_repo
            .update(id, &input)
            .await?
            .ok_or_else(|| AppError::not_found("Service not found."))
    }

    pub async fn delete(&self, id: Uuid) -> AppResult<()> {
        if !self.service_repo.delete(id).await? {
            return Err(AppError::not_found("Service not found."));
        }
        info!(service_id = %id, "Deleted service");
        Ok(())
    }

    pub async fn stats(&self, id: Uuid) -> AppResult<ServiceStats> {
        let service = self.get(id, false).await?;
        let usage = self.user_service_repo.usage_for_service(id).await?;
        Ok(ServiceStats {
            service_id: service.id,
            service_name: service.display_name,
            total_users: usage.total_users,
            active_users: usage.active_users,
            valid_cookies: self.cookie_repo.valid_count_for_service(id).await?,
            login_services: self.login_service_repo.capacity(Some(id)).await?,
        })
    }

    pub async fn all_stats(&self) -> AppResult<Vec<ServiceStats>> {
        let services = self.service_repo.list(false, None, Page::new(Some(Page::MAX_LIMIT), None)).await?;
        let mut stats = Vec::with_capacity(services.len());
        for service in services {
            stats.push(self.stats(service.id).await?);
        }
        Ok(stats)
    }
}

/// Normalizes and checks a catalog entry.
pub fn validate_input(mut input: ServiceInput) -> AppResult<ServiceInput> {
    input.name = input.name.trim().to_lowercase();
    input.display_name = input.display_name.trim().to_string();

    if input.name.is_empty() || input.name.len() > 50 {
        return Err(AppError::bad_request("Service name must be between 1 and 50 characters."));
    }
    if !input
        .name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(AppError::bad_request(
            "Service name may only contain letters, digits, '-' and '_'.",
        ));
    }
    if input.display_name.is_empty() || input.display_name.chars().count() > 100 {
        return Err(AppError::bad_request("Display name must be between 1 and 100 characters."));
    }
    match url::Url::parse(input.login_url.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {
            input.login_url = url.to_string();
        }
        _ => return Err(AppError::bad_request("Login URL must be an absolute http(s) URL.")),
    }
    Ok(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str, url: &str) -> ServiceInput {
        ServiceInput {
            name: name.into(),
            display_name: "ChatGPT".into(),
            login_url: url.into(),
            description: String::new(),
            logo_url: None,
            category: ServiceCategory::AiChat,
            is_active: true,
        }
    }

    #[test]
    fn names_are_normalized_to_slugs() {
        let ok = validate_input(input("  ChatGPT ", "https://chat.openai.com/auth/login")).unwrap();
        assert_eq!(ok.name, "chatgpt");
        assert_eq!(ok.login_url, "https://chat.openai.com/auth/login");
    }

    #[test]
    fn invalid_entries_are_rejected() {
        assert!(validate_input(input("chat gpt", "https://x.example")).is_err());
        assert!(validate_input(input("", "https://x.example")).is_err());
        assert!(validate_input(input("chatgpt", "ftp://x.example")).is_err());
        assert!(validate_input(input("chatgpt", "/relative/login")).is_err());
    }
}
