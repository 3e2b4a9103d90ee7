use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use asset_bootstrap::bootstrap::{BootstrapCoordinator, CredentialProvider, Identity};
use asset_bootstrap::config::AppConfig;
use asset_bootstrap::database::ConnectionTarget;
use asset_bootstrap::migrations::{load_scripts, MigrationRunner};
use asset_bootstrap::server::{self, AppState};
use asset_bootstrap::status::collect_status;

#[derive(Parser)]
#[command(name = "asset-bootstrap")]
#[command(about = "Apply schema migrations and bootstrap the first administrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply every migration script in order
    Migrate {
        /// Directory holding the *.sql scripts (defaults to MIGRATIONS_DIR)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Report elevated credential, profile count and installed procedures
    Status,
    /// Run the first-administrator bootstrap for one identity
    Promote {
        /// Identity id issued by the auth provider
        #[arg(long)]
        identity_id: String,

        /// Identity email, enables the promote-by-email fallback
        #[arg(long)]
        email: Option<String>,

        /// Treat this as an initial signup; without it nothing is written
        #[arg(long)]
        initial: bool,
    },
    /// Serve the health and first-admin endpoints
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "asset_bootstrap=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load()?;
    info!("Configuration loaded");

    match cli.command {
        Commands::Migrate { dir } => migrate(&config, dir).await,
        Commands::Status => {
            let provider = CredentialProvider::connect(&config).await?;
            let report = collect_status(&provider).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Promote {
            identity_id,
            email,
            initial,
        } => {
            let provider = CredentialProvider::connect(&config).await?;
            let identity = Identity::new(identity_id, email);
            let restricted = provider.restricted(&identity);
            let elevated = provider.elevated();

            let outcome = BootstrapCoordinator::from_config(&config)
                .maybe_promote_first_admin(&identity, &restricted, elevated.as_ref(), initial)
                .await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Commands::Serve => serve(config).await,
    }
}

async fn migrate(config: &AppConfig, dir: Option<PathBuf>) -> anyhow::Result<()> {
    let dir = dir.unwrap_or_else(|| PathBuf::from(&config.migrations_dir));
    let scripts = load_scripts(&dir)?;
    info!("Found {} migration scripts in {}", scripts.len(), dir.display());

    let runner = MigrationRunner::new(config.statement_retry());
    let target = ConnectionTarget::from_config(config);

    match runner.run_against(&scripts, &target, config.connect_retry()).await {
        Ok(report) => {
            info!("Database migrations completed ({} applied)", report.applied_count());
            Ok(())
        }
        Err(e) => {
            match e.script() {
                Some(script) => error!("Migration run aborted at {}: {}", script, e),
                None => error!("Migration run aborted: {}", e),
            }
            Err(e.into())
        }
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let provider = CredentialProvider::connect(&config).await?;
    let state = AppState {
        provider,
        coordinator: BootstrapCoordinator::from_config(&config),
        bearer_secret: config.migration_secret.as_deref().map(Arc::from),
    };

    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port)
        .parse()
        .context("invalid SERVER_HOST/SERVER_PORT")?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, server::router(state)).await?;

    Ok(())
}
