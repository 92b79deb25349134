use std::sync::Arc;

use anyhow::{Context, Result};
use armory_storage::{CharacterStore, PgCharacterStore};
use armory_sync::{run_scheduler, shutdown_signal, SyncConfig};
use armory_web::AppState;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "armory-cli")]
#[command(about = "Armory character scraper, addon compactor and read API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape one page per tick, compact after every traversal and serve the read API.
    Run,
    /// One full traversal followed by compaction.
    Scrape,
    /// Rebuild the addon archive from the current store.
    Compact,
    /// Serve the read API only.
    Serve,
    /// Apply the database schema.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&config).await?,
        Commands::Scrape => {
            let store = connect_store(&config).await?;
            let mut cycle = config.scrape_cycle(store)?;
            let reports = cycle.run_traversal().await?;
            let upserted: u64 = reports
                .iter()
                .map(|r| r.upsert.inserted + r.upsert.matched)
                .sum();
            let archive = reports
                .last()
                .and_then(|r| r.compaction.as_ref())
                .map(|c| c.archive_path.display().to_string())
                .unwrap_or_default();
            println!(
                "scrape complete: pages={} upserted={} archive={}",
                reports.len(),
                upserted,
                archive
            );
        }
        Commands::Compact => {
            let store = connect_store(&config).await?;
            let summary = config.compaction_driver(store).run_once().await?;
            println!(
                "compaction complete: segments={} accounts={} characters={} archive={}",
                summary.manifest.segment_count,
                summary.manifest.account_count,
                summary.manifest.character_count,
                summary.archive_path.display()
            );
        }
        Commands::Serve => {
            let store = connect_store(&config).await?;
            armory_web::serve(app_state(&config, store), config.web_port, shutdown_signal()).await?;
        }
        Commands::Migrate => {
            connect_store(&config).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

/// Connects and applies the schema. Failure here is fatal for every command.
async fn connect_store(config: &SyncConfig) -> Result<Arc<dyn CharacterStore>> {
    let store = PgCharacterStore::connect(&config.database_url)
        .await
        .context("connecting to the character store")?;
    store.migrate().await.context("applying schema")?;
    Ok(Arc::new(store))
}

fn app_state(config: &SyncConfig, store: Arc<dyn CharacterStore>) -> AppState {
    AppState::new(store, config.archive_store(), config.archive_file_name())
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn run(config: &SyncConfig) -> Result<()> {
    let store = connect_store(config).await?;
    let mut cycle = config.scrape_cycle(store.clone())?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    let web = armory_web::spawn_serve(
        app_state(config, store),
        config.web_port,
        stopped(stop_rx.clone()),
    );

    info!(every_secs = config.tick_secs, "scheduler started");
    let ticks = run_scheduler(&mut cycle, config.tick_interval(), stopped(stop_rx)).await;
    info!(ticks, "scheduler stopped");

    match tokio::time::timeout(config.shutdown_grace(), web).await {
        Ok(Ok(Ok(()))) => info!("read api stopped"),
        // Already logged by the server task when it ended.
        Ok(Ok(Err(_))) => {}
        Ok(Err(err)) => error!(error = %err, "read api task panicked"),
        Err(_) => warn!(
            grace_secs = config.shutdown_grace_secs,
            "read api did not drain within the grace period"
        ),
    }
    Ok(())
}
