use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Revoked refresh tokens, keyed by their `jti` claim.
#[derive(Debug, Clone)]
pub struct TokenRepository {
    pool: PgPool,
}

impl TokenRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn blacklist(&self, jti: Uuid, user_id: Uuid, expires_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO token_blacklist (jti, user_id, expires_at) VALUES ($1, $2, $3) ON CONFLICT (jti) DO NOTHING",
        )
        .bind(jti)
        .bind(user_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .context("Failed to blacklist token")?;
        Ok(())
    }

    pub async fn is_blacklisted(&self, jti: Uuid) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM token_blacklist WHERE jti = $1)")
            .bind(jti)
            .fetch_one(&self.pool)
            .await
            .context("Failed to check token blacklist")
    }

    /// Entries whose token has expired anyway are no longer needed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM token_blacklist WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await
            .context("Failed to purge token blacklist")?;
        Ok(result.rows_affected())
    }
}
