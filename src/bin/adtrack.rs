//! adtrack - ad event ingestion service
//!
//! Usage:
//!   adtrack serve [--api-addr ADDR] [--metrics-addr ADDR] [--db-path PATH] [--skip-migrations]
//!   adtrack migrate [--seed]
//!
//! Configuration is read from the environment (and `.env`); see `Config::from_env`.

use adtrack::api::{self, AppState};
use adtrack::pipeline::store::{run_schema_migrations, run_seed_scripts};
use adtrack::pipeline::{EventStore, SqliteEventStore};
use adtrack::{observability, Config, Runtime};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dotenv::dotenv;
use log::{error, info};
use rusqlite::Connection;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Parser)]
#[command(author, version, about = "Ad event ingestion and aggregation service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion API, aggregation engines and metrics endpoint
    Serve(ServeArgs),
    /// Apply schema migrations and exit
    Migrate(MigrateArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Overrides ADTRACK_API_ADDR
    #[arg(long)]
    api_addr: Option<SocketAddr>,

    /// Overrides ADTRACK_METRICS_ADDR
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Overrides ADTRACK_DB_PATH
    #[arg(long)]
    db_path: Option<String>,

    /// Overrides ADTRACK_PARTITIONS
    #[arg(long)]
    partitions: Option<u32>,

    /// Assume the schema already exists
    #[arg(long)]
    skip_migrations: bool,
}

#[derive(Args)]
struct MigrateArgs {
    /// Overrides ADTRACK_DB_PATH
    #[arg(long)]
    db_path: Option<String>,

    /// Also apply fixture scripts from `<schema dir>/seed`
    #[arg(long)]
    seed: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;

    match cli.command {
        Commands::Serve(args) => serve(config, args).await,
        Commands::Migrate(args) => migrate(config, args),
    }
}

fn migrate(mut config: Config, args: MigrateArgs) -> Result<()> {
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }

    info!("🔧 Migrating database: {}", config.db_path);
    if let Some(parent) = Path::new(&config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let mut conn = Connection::open(&config.db_path)
        .with_context(|| format!("failed to open {}", config.db_path))?;
    run_schema_migrations(&mut conn, &config.schema_dir)?;

    if args.seed {
        let seed_dir = Path::new(&config.schema_dir).join("seed");
        run_seed_scripts(&mut conn, &seed_dir.to_string_lossy())?;
    }

    info!("✅ Database ready");
    Ok(())
}

async fn serve(mut config: Config, args: ServeArgs) -> Result<()> {
    if let Some(addr) = args.api_addr {
        config.api_addr = addr;
    }
    if let Some(addr) = args.metrics_addr {
        config.metrics_addr = addr;
    }
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if let Some(partitions) = args.partitions {
        config.partitions = partitions;
    }
    config.validate()?;

    info!("🚀 adtrack {}", env!("CARGO_PKG_VERSION"));
    info!("   ├─ API: {}", config.api_addr);
    info!("   ├─ Metrics: {}", config.metrics_addr);
    info!("   └─ Database: {}", config.db_path);

    observability::init()?;

    let store = if args.skip_migrations {
        SqliteEventStore::open(&config.db_path)?
    } else {
        SqliteEventStore::open_with_schema(&config.db_path, &config.schema_dir)?
    };
    let store: Arc<dyn EventStore> = Arc::new(store);

    let runtime = Runtime::start(config.clone(), store).await?;
    let state = AppState::new(runtime.ingestion(), runtime.query(), config.max_request_events);

    let api_listener = TcpListener::bind(config.api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", config.api_addr))?;
    let metrics_listener = TcpListener::bind(config.metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", config.metrics_addr))?;

    let (stop_tx, stop_rx) = watch::channel(false);

    let metrics_server = {
        let mut stop = stop_rx.clone();
        tokio::spawn(async move {
            let result = axum::serve(metrics_listener, api::metrics_router())
                .with_graceful_shutdown(async move {
                    let _ = stop.wait_for(|stopped| *stopped).await;
                })
                .await;
            if let Err(e) = result {
                error!("❌ Metrics server failed: {}", e);
            }
        })
    };

    info!("✅ Listening for events on {}", config.api_addr);

    let api_result = axum::serve(api_listener, api::router(state))
        .with_graceful_shutdown(async {
            api::shutdown_signal().await;
            info!("🛑 Shutdown signal received");
        })
        .await;

    let _ = stop_tx.send(true);
    if let Err(e) = metrics_server.await {
        error!("❌ Metrics server task failed: {}", e);
    }

    runtime.shutdown().await;
    api_result.context("API server failed")?;

    info!("✅ adtrack stopped");
    Ok(())
}
