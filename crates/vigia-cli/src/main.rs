use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use vigia_notify::{DryRunGateway, GatewayConfig, MessageGateway, Notifier, WhatsAppGateway};
use vigia_scan::{maybe_build_scheduler, AlertScanner, ScanConfig};
use vigia_storage::{
    AlertStore, ListingRepository, MemoryStore, NotificationLog, PermissionStore, PgStore,
};
use vigia_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "vigia")]
#[command(about = "Vigia stale-listing alert service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scan pass and exit.
    Scan,
    /// Serve the JSON API, with the scheduler when enabled.
    Serve,
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = ScanConfig::from_env();

    match cli.command.unwrap_or(Commands::Scan) {
        Commands::Scan => {
            let (state, _) = build_state(&config).await?;
            let summary = state.scanner.run_once().await?;
            println!(
                "scan complete: run_id={} listings={} alerts={}",
                summary.run_id, summary.listings_scanned, summary.alerts_processed
            );
        }
        Commands::Serve => {
            let (state, scanner) = build_state(&config).await?;
            if let Some(sched) = maybe_build_scheduler(scanner, &config).await? {
                sched.start().await.context("starting scheduler")?;
            }
            vigia_web::serve_from_env(state).await?;
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to migrate")?;
            let store = PgStore::connect(url).await?;
            store.run_migrations().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn build_state(config: &ScanConfig) -> Result<(AppState, Arc<AlertScanner>)> {
    let (listings, alerts, log, users, permissions): (
        Arc<dyn ListingRepository>,
        Arc<dyn AlertStore>,
        Arc<dyn NotificationLog>,
        Arc<dyn vigia_storage::UserDirectory>,
        Arc<dyn PermissionStore>,
    ) = match &config.database_url {
        Some(url) => {
            let store = Arc::new(PgStore::connect(url).await.context("connecting to postgres")?);
            (
                store.clone(),
                store.clone(),
                store.clone(),
                store.clone(),
                store,
            )
        }
        None => {
            warn!("DATABASE_URL not set; using the in-memory store");
            let store = Arc::new(MemoryStore::new());
            (
                store.clone(),
                store.clone(),
                store.clone(),
                store.clone(),
                store,
            )
        }
    };

    let gateway: Arc<dyn MessageGateway> = match &config.wa_token {
        Some(token) => Arc::new(WhatsAppGateway::new(GatewayConfig {
            api_url: config.wa_api_url.clone(),
            access_token: token.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?),
        None => {
            warn!("VIGIA_WA_TOKEN not set; deliveries run in dry-run mode");
            Arc::new(DryRunGateway)
        }
    };

    let notifier = Notifier::new(gateway, log, config.listing_base_url.clone());
    let scanner = Arc::new(
        AlertScanner::new(listings.clone(), alerts.clone(), users, notifier)
            .with_reports_dir(config.reports_dir.clone()),
    );

    Ok((
        AppState {
            scanner: scanner.clone(),
            alerts,
            listings,
            permissions,
        },
        scanner,
    ))
}
