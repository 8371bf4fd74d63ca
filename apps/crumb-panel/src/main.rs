use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod cli;
mod config;
mod crypto;
mod error;
mod services;

use config::Config;
use crypto::CredentialCipher;
use services::access_service::AccessService;
use services::analytics_service::AnalyticsService;
use services::billing_service::BillingService;
use services::catalog_service::CatalogService;
use services::cookie_service::CookieService;
use services::extraction::build_extractor;
use services::extraction_service::ExtractionService;
use services::monitoring::{MonitoringService, Retention};
use services::subscription_service::SubscriptionService;
use services::user_service::UserService;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,

    pub user_service: Arc<UserService>,
    pub catalog_service: Arc<CatalogService>,
    pub subscription_service: Arc<SubscriptionService>,
    pub billing_service: Arc<BillingService>,
    pub access_service: Arc<AccessService>,
    pub cookie_service: Arc<CookieService>,
    pub extraction_service: Arc<ExtractionService>,
    pub analytics_service: Arc<AnalyticsService>,
    pub monitoring: Arc<MonitoringService>,
}

impl AppState {
    pub fn build(pool: PgPool, config: Config) -> Result<Self> {
        if let Err(e) = config.validate() {
            error!("Refusing to start: {:#}", e);
            return Err(e);
        }
        let cipher = CredentialCipher::new(config.credential_key.as_deref(), &config.credential_key_id)
            .context("Invalid CREDENTIAL_KEY")?;

        let user_service = Arc::new(UserService::new(
            pool.clone(),
            config.jwt_secret.clone(),
            config.access_ttl(),
            config.refresh_ttl(),
        ));
        let subscription_service = Arc::new(SubscriptionService::new(pool.clone()));
        let billing_service = Arc::new(BillingService::new(pool.clone(), subscription_service.clone()));
        let access_service = Arc::new(AccessService::new(pool.clone(), cipher));
        let cookie_service = Arc::new(CookieService::new(pool.clone(), access_service.clone()));
        let extraction_service = Arc::new(ExtractionService::new(
            pool.clone(),
            access_service.clone(),
            cookie_service.clone(),
            build_extractor(config.extractor, config.extraction_timeout()),
            config.cookie_ttl(),
        ));
        let monitoring = Arc::new(MonitoringService::new(
            pool.clone(),
            cookie_service.clone(),
            user_service.clone(),
            Retention {
                cookie_days: config.cookie_retention_days.clamp(1, Retention::MAX_DAYS),
                log_days: config.log_retention_days.clamp(1, Retention::MAX_DAYS),
            },
            config.maintenance_interval(),
        ));

        Ok(Self {
            catalog_service: Arc::new(CatalogService::new(pool.clone())),
            analytics_service: Arc::new(AnalyticsService::new(pool.clone())),
            user_service,
            subscription_service,
            billing_service,
            access_service,
            cookie_service,
            extraction_service,
            monitoring,
            config: Arc::new(config),
            pool,
        })
    }
}

#[derive(Parser)]
#[command(name = "crumb-panel")]
#[command(about = "Crumb subscription-gated session broker", long_about = None, version)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API and background maintenance
    Serve,
    /// Administrative tools
    Admin {
        #[command(subcommand)]
        subcommand: AdminCommands,
    },
    /// Insert the demo catalog and subscription plans
    Seed,
    /// Run one cookie validation and cleanup pass, then exit
    Maintenance,
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Create an administrator, or promote and reset an existing account
    CreateSuperuser {
        email: String,
        password: String,
        #[arg(long, default_value = "Administrator")]
        full_name: String,
    },
    /// Reset a user's password
    ResetPassword { email: String, new_pass: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: failed to load .env file: {}", e);
        }
    }

    let cli = Cli::parse();

    let file_appender = tracing_appender::rolling::never(&cli.config.log_dir, "server.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crumb_panel=debug,crumb_db=info,tower_http=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    let pool = crumb_db::db::init_db(&cli.config.database_url, cli.config.database_max_connections).await?;
    info!("Database initialized");

    match cli.command {
        Commands::Serve => {
            let state = AppState::build(pool, cli.config)?;
            run_server(state).await?;
        }
        Commands::Admin { subcommand } => match subcommand {
            AdminCommands::CreateSuperuser {
                email,
                password,
                full_name,
            } => {
                cli::create_superuser(&pool, &email, &full_name, &password).await?;
            }
            AdminCommands::ResetPassword { email, new_pass } => {
                cli::reset_password(&pool, &email, &new_pass).await?;
            }
        },
        Commands::Seed => {
            cli::seed(&pool).await?;
        }
        Commands::Maintenance => {
            let state = AppState::build(pool, cli.config)?;
            let (validation, cleanup) = state.monitoring.run_pass().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "validation": validation,
                    "cleanup": cleanup,
                }))?
            );
        }
    }

    Ok(())
}

async fn run_server(state: AppState) -> Result<()> {
    let monitor = state.monitoring.clone();
    tokio::spawn(async move {
        monitor.start().await;
    });

    let addr = state.config.listen_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Crumb API listening on http://{}", addr);

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
