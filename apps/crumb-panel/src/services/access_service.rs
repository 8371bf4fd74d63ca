use crumb_db::models::access::{
    Activation, LoginService, LoginServiceInput, LoginServiceUpdate, Release, UserService,
    UserServiceStatus,
};
use crumb_db::repositories::Page;
use crumb_db::repositories::login_service_repo::LoginServiceRepository;
use crumb_db::repositories::service_repo::ServiceRepository;
use crumb_db::repositories::user_service_repo::{
    AssignmentFilter, RequestOutcome, UserServiceRepository,
};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::crypto::CredentialCipher;
use crate::error::{AppError, AppResult};

/// Assignment of users to services and to pooled login services.
#[derive(Debug, Clone)]
pub struct AccessService {
    user_service_repo: UserServiceRepository,
    login_service_repo: LoginServiceRepository,
    service_repo: ServiceRepository,
    cipher: CredentialCipher,
}

impl AccessService {
    pub fn new(pool: PgPool, cipher: CredentialCipher) -> Self {
        Self {
            user_service_repo: UserServiceRepository::new(pool.clone()),
            login_service_repo: LoginServiceRepository::new(pool.clone()),
            service_repo: ServiceRepository::new(pool),
            cipher,
        }
    }

    /// Opens a pending access request for an entitled user.
    pub async fn request_access(&self, user_id: Uuid, service_id: Uuid) -> AppResult<UserService> {
        let service = self
            .service_repo
            .get_by_id(service_id)
            .await?
            .filter(|s| s.is_active)
            .ok_or_else(|| AppError::not_found("Service not found."))?;

        if !self.service_repo.is_entitled(user_id, service.id).await? {
            return Err(AppError::forbidden(
                "Your active subscriptions do not include this service.",
            ));
        }

        if let Some(existing) = self.user_service_repo.get_for_user(user_id, service.id).await? {
            if !existing.status.can_rerequest() {
                return Err(already_requested(existing.status));
            }
        }

        match self.user_service_repo.request(user_id, service.id).await? {
            RequestOutcome::Created(assignment) => {
                info!(
                    user_service_id = %assignment.id,
                    user_id = %user_id,
                    service = %service.name,
                    "Access requested"
                );
                self.assignment(assignment.id).await
            }
            RequestOutcome::Exists(status) => Err(already_requested(status)),
            RequestOutcome::LimitReached(allowance) => Err(AppError::forbidden(format!(
                "You have reached your limit of {allowance} services."
            ))),
        }
    }

    pub async fn assignment(&self, id: Uuid) -> AppResult<UserService> {
        self.user_service_repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found("User service not found."))
    }

    /// The user's active assignment for a service, if any.
    pub async fn active_assignment(&self, user_id: Uuid, service_id: Uuid) -> AppResult<Option<UserService>> {
        Ok(self
            .user_service_repo
            .get_for_user(user_id, service_id)
            .await?
            .filter(|a| a.status == UserServiceStatus::Active))
    }

    pub async fn is_entitled(&self, user_id: Uuid, service_id: Uuid) -> AppResult<bool> {
        Ok(self.service_repo.is_entitled(user_id, service_id).await?)
    }

    pub async fn record_access(&self, user_service_id: Uuid) -> AppResult<()> {
        Ok(self.user_service_repo.record_access(user_service_id).await?)
    }

    pub async fn list(&self, filter: AssignmentFilter, page: Page) -> AppResult<Vec<UserService>> {
        Ok(self.user_service_repo.list(&filter, page).await?)
    }

    pub async fn user_assignments(
        &self,
        user_id: Uuid,
        status: Option<UserServiceStatus>,
        page: Page,
    ) -> AppResult<Vec<UserService>> {
        let filter = AssignmentFilter {
            status,
            user_id: Some(user_id),
            service_id: None,
        };
        self.list(filter, page).await
    }

    /// Approves a pending request by reserving a login service slot.
    pub async fn approve(&self, id: Uuid, pinned: Option<Uuid>) -> AppResult<UserService> {
        if let Some(login_service_id) = pinned {
            let assignment = self.assignment(id).await?;
            let login_service = self.login_service(login_service_id).await?;
            if login_service.service_id != assignment.service_id {
                return Err(AppError::bad_request(
                    "Login service belongs to a different service.",
                ));
            }
        }

        match self.user_service_repo.activate(id, pinned).await? {
            None => Err(AppError::not_found("User service not found.")),
            Some(Activation::NotPending(status)) => Err(AppError::bad_request(format!(
                "Only pending requests can be approved (current status: {status})."
            ))),
            Some(Activation::NoCapacity) => {
                warn!(user_service_id = %id, "Approval failed: no login service capacity");
                Err(AppError::conflict(
                    "No active login service with free capacity is available for this service.",
                ))
            }
            Some(Activation::Activated {
                assignment,
                login_service,
            }) => {
                info!(
                    user_service_id = %assignment.id,
                    login_service_id = %login_service.id,
                    current_users = login_service.current_users,
                    max_users = login_service.max_concurrent_users,
                    "Access approved"
                );
                self.assignment(assignment.id).await
            }
        }
    }

    pub async fn reject(&self, id: Uuid) -> AppResult<UserService> {
        match self.user_service_repo.reject(id).await? {
            Some(assignment) => {
                info!(user_service_id = %assignment.id, "Access request rejected");
                self.assignment(assignment.id).await
            }
            None => {
                let current = self.assignment(id).await?;
                Err(AppError::bad_request(format!(
                    "Only pending requests can be rejected (current status: {}).",
                    current.status
                )))
            }
        }
    }

    pub async fn deactivate(&self, id: Uuid) -> AppResult<UserService> {
        self.release(id, UserServiceStatus::Inactive).await
    }

    pub async fn suspend(&self, id: Uuid) -> AppResult<UserService> {
        self.release(id, UserServiceStatus::Suspended).await
    }

    async fn release(&self, id: Uuid, target: UserServiceStatus) -> AppResult<UserService> {
        match self.user_service_repo.release(id, target).await? {
            None => Err(AppError::not_found("User service not found.")),
            Some(Release::InvalidState(status)) => Err(AppError::bad_request(format!(
                "Only active services can be moved to {target} (current status: {status})."
            ))),
            Some(Release::Released {
                assignment,
                freed_login_service,
            }) => {
                info!(
                    user_service_id = %assignment.id,
                    status = %target,
                    login_service_id = ?freed_login_service,
                    "Access released"
                );
                self.assignment(assignment.id).await
            }
        }
    }

    pub async fn reinstate(&self, id: Uuid) -> AppResult<UserService> {
        match self.user_service_repo.reinstate(id).await? {
            Some(assignment) => {
                info!(user_service_id = %assignment.id, "Suspended access reinstated for approval");
                self.assignment(assignment.id).await
            }
            None => {
                let current = self.assignment(id).await?;
                Err(AppError::bad_request(format!(
                    "Only suspended services can be reinstated (current status: {}).",
                    current.status
                )))
            }
        }
    }

    pub async fn login_services(
        &self,
        service_id: Option<Uuid>,
        active: Option<bool>,
    ) -> AppResult<Vec<LoginService>> {
        Ok(self.login_service_repo.list(service_id, active).await?)
    }

    pub async fn login_service(&self, id: Uuid) -> AppResult<LoginService> {
        self.login_service_repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found("Login service not found."))
    }

    pub async fn create_login_service(&self, mut input: LoginServiceInput) -> AppResult<LoginService> {
        self.service_repo
            .get_by_id(input.service_id)
            .await?
            .ok_or_else(|| AppError::bad_request("Service does not exist."))?;

        input.username = input.username.trim().to_string();
        if input.username.is_empty() || input.username.chars().count() > 100 {
            return Err(AppError::bad_request("Username must be between 1 and 100 characters."));
        }
        if input.password.is_empty() {
            return Err(AppError::bad_request("Password is required."));
        }
        if input.max_concurrent_users <= 0 {
            return Err(AppError::bad_request("Max concurrent users must be at least 1."));
        }
        if !input.additional_credentials.is_object() {
            return Err(AppError::bad_request("Additional credentials must be a JSON object."));
        }

        let sealed = self.cipher.encrypt(&input.password)?;
        let created = self.login_service_repo.create(&input, &sealed).await?;
        info!(login_service_id = %created.id, service_id = %created.service_id, "Created login service");
        self.login_service(created.id).await
    }

    pub async fn update_login_service(&self, id: Uuid, update: LoginServiceUpdate) -> AppResult<LoginService> {
        let current = self.login_service(id).await?;

        if let Some(max) = update.max_concurrent_users {
            if max <= 0 {
                return Err(AppError::bad_request("Max concurrent users must be at least 1."));
            }
            if max < current.current_users {
                return Err(AppError::bad_request(format!(
                    "Max concurrent users cannot be lower than the {} users currently assigned.",
                    current.current_users
                )));
            }
        }
        if let Some(username) = &update.username {
            if username.trim().is_empty() {
                return Err(AppError::bad_request("Username cannot be empty."));
            }
        }
        if let Some(extra) = &update.additional_credentials {
            if !extra.is_object() {
                return Err(AppError::bad_request("Additional credentials must be a JSON object."));
            }
        }

        let sealed = match update.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => Some(self.cipher.encrypt(password)?),
            None => None,
        };

        let updated = self
            .login_service_repo
            .update(id, &update, sealed.as_deref())
            .await?
            .ok_or_else(|| {
                AppError::conflict("Login service capacity changed concurrently; retry the update.")
            })?;
        self.login_service(updated.id).await
    }

    pub async fn delete_login_service(&self, id: Uuid) -> AppResult<()> {
        let current = self.login_service(id).await?;
        if current.current_users > 0 || !self.login_service_repo.delete_unused(id).await? {
            return Err(AppError::conflict(
                "Login service still has assigned users; deactivate their access first.",
            ));
        }
        info!(login_service_id = %id, "Deleted login service");
        Ok(())
    }

    /// Decrypted password for an extraction run.
    pub fn reveal_password(&self, login_service: &LoginService) -> anyhow::Result<String> {
        self.cipher.decrypt(&login_service.encrypted_password)
    }

    pub async fn touch_login_attempt(&self, id: Uuid) -> AppResult<()> {
        Ok(self.login_service_repo.touch_login_attempt(id).await?)
    }

    pub async fn active_on_login_service(&self, login_service_id: Uuid) -> AppResult<Vec<UserService>> {
        Ok(self
            .user_service_repo
            .active_on_login_service(login_service_id)
            .await?)
    }
}

fn already_requested(status: UserServiceStatus) -> AppError {
    let message = match status {
        UserServiceStatus::Pending => "Access to this service is already pending approval.",
        UserServiceStatus::Active => "You already have access to this service.",
        UserServiceStatus::Suspended => "Your access to this service is suspended.",
        UserServiceStatus::Inactive => "Access to this service was already requested.",
    };
    AppError::conflict(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_requests_are_conflicts() {
        for status in [
            UserServiceStatus::Pending,
            UserServiceStatus::Active,
            UserServiceStatus::Suspended,
        ] {
            assert!(matches!(already_requested(status), AppError::Conflict(_)));
        }
    }
}
