use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::access::{Activation, LoginService, Release, UserService, UserServiceStatus};
use crate::models::cookie::StatusCount;
use crate::repositories::{ENTITLEMENTS, Page};

const ASSIGNMENT_SELECT: &str = r#"
    SELECT usv.*,
           s.display_name AS service_name,
           u.email AS user_email,
           EXISTS (
               SELECT 1 FROM cookies c
               WHERE c.user_service_id = usv.id AND c.status = 'valid' AND c.expires_at > NOW()
           ) AS has_valid_cookies,
           (SELECT MAX(c.extracted_at) FROM cookies c WHERE c.user_service_id = usv.id) AS last_cookie_update
    FROM user_services usv
    JOIN services s ON s.id = usv.service_id
    JOIN users u ON u.id = usv.user_id
"#;

const RESERVE_ATTEMPTS: usize = 8;

/// Result of an access request.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Created(UserService),
    /// An assignment exists in a state that cannot be requested again.
    Exists(UserServiceStatus),
    /// The user already holds as many assignments as their subscriptions allow.
    LimitReached(i64),
}

#[derive(Debug, Clone, Default)]
pub struct AssignmentFilter {
    pub status: Option<UserServiceStatus>,
    pub service_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, FromRow)]
pub struct ServiceUsage {
    pub total_users: i64,
    pub active_users: i64,
}

#[derive(Debug, Clone)]
pub struct UserServiceRepository {
    pool: PgPool,
}

impl UserServiceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<UserService>> {
        let sql = format!("{ASSIGNMENT_SELECT} WHERE usv.id = $1");
        sqlx::query_as::<_, UserService>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user service by ID")
    }

    pub async fn get_for_user(&self, user_id: Uuid, service_id: Uuid) -> Result<Option<UserService>> {
        let sql = format!("{ASSIGNMENT_SELECT} WHERE usv.user_id = $1 AND usv.service_id = $2");
        sqlx::query_as::<_, UserService>(&sql)
            .bind(user_id)
            .bind(service_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user service")
    }

    pub async fn list(&self, filter: &AssignmentFilter, page: Page) -> Result<Vec<UserService>> {
        let sql = format!(
            r#"{ASSIGNMENT_SELECT}
            WHERE ($1::text IS NULL OR usv.status = $1)
              AND ($2::uuid IS NULL OR usv.service_id = $2)
              AND ($3::uuid IS NULL OR usv.user_id = $3)
            ORDER BY usv.assigned_at DESC
            LIMIT $4 OFFSET $5"#
        );
        sqlx::query_as::<_, UserService>(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.service_id)
            .bind(filter.user_id)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list user services")
    }

    /// Opens a pending assignment, or reopens an inactive one, as long as the
    /// user holds fewer assignments than their subscriptions allow. The user
    /// row is locked for the check so concurrent requests cannot overshoot.
    pub async fn request(&self, user_id: Uuid, service_id: Uuid) -> Result<RequestOutcome> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .context("Failed to lock user")?;

        let (allowance, held): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COALESCE(SUM(p.max_services), 0)::BIGINT
                 FROM user_subscriptions us
                 JOIN subscription_plans p ON p.id = us.plan_id
                 WHERE us.user_id = $1 AND us.is_active = TRUE AND us.expires_at > NOW()),
                (SELECT COUNT(*)
                 FROM user_services
                 WHERE user_id = $1 AND status IN ('pending', 'active'))
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to compute service allowance")?;

        if held >= allowance {
            return Ok(RequestOutcome::LimitReached(allowance));
        }

        let created = sqlx::query_as::<_, UserService>(
            r#"
            INSERT INTO user_services (user_id, service_id, status, assigned_at)
            VALUES ($1, $2, 'pending', NOW())
            ON CONFLICT (user_id, service_id) DO UPDATE
            SET status = 'pending', login_service_id = NULL, assigned_at = NOW()
            WHERE user_services.status = 'inactive'
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(service_id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to create access request")?;

        if let Some(assignment) = created {
            tx.commit().await?;
            return Ok(RequestOutcome::Created(assignment));
        }

        let status: String = sqlx::query_scalar(
            "SELECT status FROM user_services WHERE user_id = $1 AND service_id = $2",
        )
        .bind(user_id)
        .bind(service_id)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to read existing assignment")?;

        tx.commit().await?;
        Ok(RequestOutcome::Exists(status.parse()?))
    }

    /// Approves a pending assignment by reserving one slot on a login service
    /// for its service. `pinned` restricts the choice to one login service.
    /// The reservation and the status change commit together.
    pub async fn activate(&self, id: Uuid, pinned: Option<Uuid>) -> Result<Option<Activation>> {
        let mut tx = self.pool.begin().await?;

        let Some(current) = Self::lock(&mut tx, id).await? else {
            return Ok(None);
        };
        if current.status != UserServiceStatus::Pending {
            return Ok(Some(Activation::NotPending(current.status)));
        }

        let Some(login_service) = Self::reserve_slot(&mut tx, current.service_id, pinned).await? else {
            return Ok(Some(Activation::NoCapacity));
        };

        let assignment = sqlx::query_as::<_, UserService>(
            "UPDATE user_services SET status = 'active', login_service_id = $2 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(login_service.id)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to activate user service")?;

        tx.commit().await?;
        Ok(Some(Activation::Activated {
            assignment,
            login_service,
        }))
    }

    /// Takes one slot on the least used eligible login service. A concurrent
    /// approval holding the chosen row makes this wait; if that approval took
    /// the row's last slot the pick comes back empty and is retried while any
    /// eligible login service still has room.
    async fn reserve_slot(
        tx: &mut Transaction<'_, Postgres>,
        service_id: Uuid,
        pinned: Option<Uuid>,
    ) -> Result<Option<LoginService>> {
        for _ in 0..RESERVE_ATTEMPTS {
            let reserved = sqlx::query_as::<_, LoginService>(
                r#"
                UPDATE login_services
                SET current_users = current_users + 1, updated_at = NOW()
                WHERE id = (
                    SELECT id FROM login_services
                    WHERE service_id = $1
                      AND is_active = TRUE
                      AND current_users < max_concurrent_users
                      AND ($2::uuid IS NULL OR id = $2)
                    ORDER BY current_users ASC, created_at ASC
                    LIMIT 1
                    FOR UPDATE
                )
                AND current_users < max_concurrent_users
                RETURNING *
                "#,
            )
            .bind(service_id)
            .bind(pinned)
            .fetch_optional(&mut **tx)
            .await
            .context("Failed to reserve login service slot")?;

            if reserved.is_some() {
                return Ok(reserved);
            }

            let has_room: bool = sqlx::query_scalar(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM login_services
                    WHERE service_id = $1
                      AND is_active = TRUE
                      AND current_users < max_concurrent_users
                      AND ($2::uuid IS NULL OR id = $2)
                )
                "#,
            )
            .bind(service_id)
            .bind(pinned)
            .fetch_one(&mut **tx)
            .await
            .context("Failed to check login service capacity")?;

            if !has_room {
                return Ok(None);
            }
        }
        Ok(None)
    }

    /// Moves an active assignment to `target` (inactive or suspended), frees
    /// the slot it held and invalidates its live cookies, all in one transaction.
    pub async fn release(&self, id: Uuid, target: UserServiceStatus) -> Result<Option<Release>> {
        let mut tx = self.pool.begin().await?;

        let Some(current) = Self::lock(&mut tx, id).await? else {
            return Ok(None);
        };
        if current.status != UserServiceStatus::Active || !current.status.can_transition_to(target) {
            return Ok(Some(Release::InvalidState(current.status)));
        }

        let (assignment, freed) = Self::release_locked(&mut tx, &current, target).await?;
        tx.commit().await?;

        Ok(Some(Release::Released {
            assignment,
            freed_login_service: freed,
        }))
    }

    async fn lock(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<Option<UserService>> {
        sqlx::query_as::<_, UserService>("SELECT * FROM user_services WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .context("Failed to lock user service")
    }

    async fn release_locked(
        tx: &mut Transaction<'_, Postgres>,
        current: &UserService,
        target: UserServiceStatus,
    ) -> Result<(UserService, Option<Uuid>)> {
        let assignment = sqlx::query_as::<_, UserService>(
            "UPDATE user_services SET status = $2 WHERE id = $1 RETURNING *",
        )
        .bind(current.id)
        .bind(target.as_str())
        .fetch_one(&mut **tx)
        .await
        .context("Failed to update user service status")?;

        if let Some(login_service_id) = current.login_service_id {
            sqlx::query(
                "UPDATE login_services SET current_users = GREATEST(current_users - 1, 0), updated_at = NOW() WHERE id = $1",
            )
            .bind(login_service_id)
            .execute(&mut **tx)
            .await
            .context("Failed to release login service slot")?;
        }

        sqlx::query(
            "UPDATE cookies SET status = 'invalid' WHERE user_service_id = $1 AND status IN ('valid', 'pending_validation')",
        )
        .bind(current.id)
        .execute(&mut **tx)
        .await
        .context("Failed to invalidate released cookies")?;

        Ok((assignment, current.login_service_id))
    }

    /// pending -> inactive. `None` when the assignment is not pending.
    pub async fn reject(&self, id: Uuid) -> Result<Option<UserService>> {
        sqlx::query_as::<_, UserService>(
            "UPDATE user_services SET status = 'inactive' WHERE id = $1 AND status = 'pending' RETURNING *",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to reject access request")
    }

    /// suspended -> pending. `None` when the assignment is not suspended.
    pub async fn reinstate(&self, id: Uuid) -> Result<Option<UserService>> {
        sqlx::query_as::<_, UserService>(
            "UPDATE user_services SET status = 'pending' WHERE id = $1 AND status = 'suspended' RETURNING *",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to reinstate user service")
    }

    pub async fn record_access(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE user_services SET last_accessed = NOW(), access_count = access_count + 1 WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to record access")?;
        Ok(())
    }

    /// Deactivates pending and active assignments whose user is no longer
    /// entitled to the service, freeing held slots. Scoped to one user when
    /// `user_id` is given. Returns the number of assignments released.
    pub async fn release_unentitled(&self, user_id: Option<Uuid>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            SELECT usv.* FROM user_services usv
            JOIN services s ON s.id = usv.service_id
            WHERE usv.status IN ('pending', 'active')
              AND ($1::uuid IS NULL OR usv.user_id = $1)
              AND (
                  s.is_active = FALSE
                  OR NOT EXISTS (
                      SELECT 1 FROM ({ENTITLEMENTS}) e
                      WHERE e.user_id = usv.user_id AND e.service_id = usv.service_id
                  )
              )
            FOR UPDATE OF usv
            "#
        );
        let stale = sqlx::query_as::<_, UserService>(&sql)
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await
            .context("Failed to find unentitled assignments")?;

        for assignment in &stale {
            if assignment.status == UserServiceStatus::Active {
                Self::release_locked(&mut tx, assignment, UserServiceStatus::Inactive).await?;
            } else {
                sqlx::query("UPDATE user_services SET status = 'inactive' WHERE id = $1")
                    .bind(assignment.id)
                    .execute(&mut *tx)
                    .await
                    .context("Failed to close unentitled request")?;
            }
        }

        tx.commit().await?;
        Ok(stale.len() as u64)
    }

    pub async fn active_on_login_service(&self, login_service_id: Uuid) -> Result<Vec<UserService>> {
        sqlx::query_as::<_, UserService>(
            "SELECT * FROM user_services WHERE login_service_id = $1 AND status = 'active'",
        )
        .bind(login_service_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch assignments on login service")
    }

    pub async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        sqlx::query_as::<_, StatusCount>(
            "SELECT status, COUNT(*) AS count FROM user_services GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to count user services per status")
    }

    pub async fn usage_for_service(&self, service_id: Uuid) -> Result<ServiceUsage> {
        sqlx::query_as::<_, ServiceUsage>(
            r#"
            SELECT COUNT(DISTINCT user_id) AS total_users,
                   COUNT(DISTINCT user_id) FILTER (WHERE status = 'active') AS active_users
            FROM user_services
            WHERE service_id = $1
            "#,
        )
        .bind(service_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute service usage")
    }
}
