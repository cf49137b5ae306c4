mod catalog;
mod config;
mod engine;
mod error;
mod mapper;
mod metadata;
mod query;
mod reader;
mod server;
mod source;
mod sync;
mod telemetry;
mod types;
mod writer;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::engine::QueryEngine;
use crate::query::QueryHandler;
use crate::reader::IcebergReader;
use crate::sync::{SyncOptions, Syncer};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "bemidb", about = "Postgres-compatible analytics over Iceberg tables")]
struct Cli {
    /// Path to the config YAML file
    #[arg(short, long, default_value = "bemidb.yml")]
    config: String,

    /// Sync changes since this time ("24h" or an RFC3339 timestamp)
    #[arg(long)]
    since: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the Postgres wire protocol over the warehouse (default)
    Start,
    /// Sync tables from the source database into the warehouse
    Sync,
    /// Print the version and exit
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("bemidb=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = config::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => start(config).await,
        Commands::Sync => run_sync(config, cli.since.as_deref()).await,
        Commands::Version => {
            println!("BemiDB version: {VERSION}");
            Ok(())
        }
    }
}

async fn start(config: Config) -> Result<()> {
    let file_io = catalog::build_file_io()?;
    let reader = IcebergReader::new(config.warehouse_path(), file_io);
    let engine = Arc::new(QueryEngine::new(reader));
    engine.refresh().await?;

    let handler = Arc::new(QueryHandler::new(engine, config.pg.schema_prefix.clone()));
    server::serve(&config, handler).await
}

async fn run_sync(config: Config, since: Option<&str>) -> Result<()> {
    let options = SyncOptions {
        since: parse_since(since)?,
    };
    if let Some(since) = options.since {
        tracing::info!(since = %since.to_rfc3339(), "incremental sync");
    }

    let syncer = Syncer::new(config.clone());
    match &config.pg.sync_interval {
        Some(interval) => {
            let duration = config::parse_duration(interval)
                .with_context(|| format!("invalid sync interval: {interval}"))?;
            tracing::info!(interval = %interval, "starting sync loop");
            loop {
                // A failed run is retried at the next interval.
                if let Err(e) = syncer.sync_from_source(options).await {
                    tracing::error!(error = %e, "sync run failed");
                }
                tracing::info!(seconds = duration.as_secs(), "sleeping until next sync");
                tokio::time::sleep(duration).await;
            }
        }
        None => {
            syncer.sync_from_source(options).await?;
            tracing::info!("sync complete");
            Ok(())
        }
    }
}

fn parse_since(since: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = since else { return Ok(None) };
    if let Ok(duration) = config::parse_duration(raw) {
        let duration = chrono::Duration::from_std(duration).context("since duration too large")?;
        return Ok(Some(Utc::now() - duration));
    }
    let instant = DateTime::parse_from_rfc3339(raw)
        .context("invalid --since value; use a duration ('24h') or an RFC3339 timestamp")?;
    Ok(Some(instant.with_timezone(&Utc)))
}
