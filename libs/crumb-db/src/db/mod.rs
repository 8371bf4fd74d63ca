use anyhow::{Context, Result};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;

pub fn validate_database_url(database_url: &str) -> Result<()> {
    if !database_url.starts_with("postgres://") && !database_url.starts_with("postgresql://") {
        return Err(anyhow::anyhow!(
            "DATABASE_URL must start with postgres:// or postgresql://"
        ));
    }
    Ok(())
}

pub async fn init_db(database_url: &str, max_connections: u32) -> Result<PgPool> {
    validate_database_url(database_url)?;

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    info!(max_connections, "Database pool ready and migrations applied");

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::validate_database_url;

    #[test]
    fn accepts_both_postgres_schemes() {
        assert!(validate_database_url("postgres://u:p@localhost/crumb").is_ok());
        assert!(validate_database_url("postgresql://localhost/crumb").is_ok());
    }

    #[test]
    fn rejects_sqlite_urls() {
        assert!(validate_database_url("sqlite://crumb.db").is_err());
    }
}
