use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use recon_core::{ExternalRecord, SyncRequest, SyncResponse};
use recon_storage::PgContentStore;
use recon_sync::{SyncConfig, SyncEngine};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "recon-cli")]
#[command(about = "Post reconciliation command-line interface")]
struct Cli {
    /// Debug-level logging unless RUST_LOG is set.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile a JSON payload against the store.
    Sync {
        /// A sync request object, or a bare array of records.
        #[arg(short, long)]
        file: PathBuf,
        /// Owner scope; overrides any scope in the file.
        #[arg(short, long)]
        scope: Option<String>,
        #[arg(long)]
        optimize_by_date: bool,
        /// Print the plan without writing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Run the HTTP api.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Sync {
            file,
            scope,
            optimize_by_date,
            dry_run,
        } => {
            let mut request = read_request(&file).await?;
            if scope.is_some() {
                request.scope = scope;
            }
            if optimize_by_date {
                request.optimize_by_date = Some(true);
            }
            run_sync(request, dry_run).await?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgContentStore::connect(&config.database_url)
                .await
                .context("connecting to post store")?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::Serve => recon_web::serve_from_env().await?,
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_sync(request: SyncRequest, dry_run: bool) -> Result<()> {
    let config = SyncConfig::from_env();
    let store = PgContentStore::connect(&config.database_url)
        .await
        .context("connecting to post store")?;
    let engine = SyncEngine::from_config(Arc::new(store), &config)?;

    if dry_run {
        let plan = engine.plan(&request).await?;
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    let result = engine.run(request).await;
    println!("{}", serde_json::to_string_pretty(&SyncResponse::from(&result))?);
    if let Some(error) = result.error {
        anyhow::bail!("sync failed: {error}");
    }
    Ok(())
}

async fn read_request(path: &Path) -> Result<SyncRequest> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_request(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn parse_request(raw: &str) -> Result<SyncRequest> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    if value.is_array() {
        let records: Vec<ExternalRecord> = serde_json::from_value(value)?;
        return Ok(SyncRequest::new(None, records));
    }
    Ok(serde_json::from_value(value)?)
}
