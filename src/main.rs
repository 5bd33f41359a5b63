use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use warehouse_sync::config::Config;
use warehouse_sync::engine::Engine;
use warehouse_sync::errors::SyncError;
use warehouse_sync::index::xmlrpc::XmlRpcIndexClient;
use warehouse_sync::index::IndexClient;
use warehouse_sync::reconciler::ReleaseReconciler;
use warehouse_sync::retry::RetryingClient;
use warehouse_sync::store::{RedisStore, Store};
use warehouse_sync::warehouse::rest::RestWarehouseClient;
use warehouse_sync::warehouse::WarehouseClient;

#[derive(Parser)]
#[command(name = "warehouse-sync")]
#[command(about = "Synchronization engine that mirrors a package index into a Warehouse", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the TOML config file. Falls back to WAREHOUSE_SYNC_CONF.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run exactly one Engine::tick and exit.
    Sync,
    /// Run Engine::tick on the configured schedule.packages interval until
    /// SIGINT/SIGTERM.
    Serve,
    /// One-shot full crawl, sharded by package name.
    BulkImport {
        /// "N/M": this is shard N of M, 0-indexed.
        #[arg(long, default_value = "0/1")]
        shard: String,
        /// Maximum packages reconciled concurrently.
        #[arg(long, default_value_t = 8)]
        concurrency: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::resolve_path(cli.config.as_deref())
        .and_then(|path| Config::load(&path))
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.logging.filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let engine = match build_engine(&config).await {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("could not initialize sync engine: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Sync => run_sync(&engine).await,
        Commands::Serve => run_serve(&engine, &config).await,
        Commands::BulkImport { shard, concurrency } => {
            run_bulk_import(&config, &shard, concurrency).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn build_http(config: &Config) -> Result<Arc<RetryingClient>, SyncError> {
    RetryingClient::build(config.index.ssl_verify)
}

async fn build_engine(config: &Config) -> Result<Engine, SyncError> {
    let (index, warehouse, store) = build_clients(config).await?;
    Ok(Engine::new(index, warehouse, store))
}

async fn build_clients(
    config: &Config,
) -> Result<
    (
        Arc<dyn IndexClient>,
        Arc<dyn WarehouseClient>,
        Arc<dyn Store>,
    ),
    SyncError,
> {
    let http = build_http(config).await?;

    let index: Arc<dyn IndexClient> =
        Arc::new(XmlRpcIndexClient::new(http.clone(), config.index.url.clone()));

    let warehouse: Arc<dyn WarehouseClient> = Arc::new(RestWarehouseClient::new(
        http,
        config.warehouse.url.clone(),
        config.warehouse.auth.username.clone(),
        config.warehouse.auth.password.clone(),
    ));

    let redis_connection = config.redis.connection.clone().ok_or_else(|| {
        SyncError::Config("redis.connection is required".to_string())
    })?;
    let store: Arc<dyn Store> = Arc::new(
        RedisStore::connect(&redis_connection.to_url(), config.redis.prefix.clone()).await?,
    );

    Ok((index, warehouse, store))
}

async fn run_sync(engine: &Engine) -> Result<(), SyncError> {
    tracing::info!("running one sync tick");
    engine.tick(unix_epoch_now()).await
}

async fn run_serve(engine: &Engine, config: &Config) -> Result<(), SyncError> {
    let interval_seconds = config
        .schedule
        .packages
        .as_ref()
        .map(|p| p.interval_seconds)
        .unwrap_or(30);

    tracing::info!(interval_seconds, "starting serve loop");
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_seconds));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = engine.tick(unix_epoch_now()).await {
                    tracing::error!("tick failed: {e}");
                }
            }
            _ = shutdown_signal() => {
                tracing::info!("shutting down, awaiting in-flight tick");
                break;
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// A10 — one-shot full crawl, sharded by `hash(name) % shard_count ==
/// shard_index`, bounded concurrency via a semaphore (same shape as the
/// teacher's `osv.rs` advisory fan-out).
async fn run_bulk_import(
    config: &Config,
    shard: &str,
    concurrency: usize,
) -> Result<(), SyncError> {
    let (shard_index, shard_count) = parse_shard(shard)?;

    let (index, warehouse, store) = build_clients(config).await?;
    let reconciler = Arc::new(ReleaseReconciler::new(index.clone(), warehouse, store));

    let packages = index.list_packages().await?;
    let shard_packages: Vec<String> = packages
        .into_iter()
        .filter(|name| package_shard(name, shard_count) == shard_index)
        .collect();

    tracing::info!(
        shard_index,
        shard_count,
        count = shard_packages.len(),
        "starting bulk import shard"
    );

    let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency.max(1)));
    let mut tasks = Vec::with_capacity(shard_packages.len());

    for name in shard_packages {
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closes");
        let reconciler = reconciler.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = reconciler.update(&name, None).await {
                tracing::warn!(name, "bulk import failed for package: {e}");
            }
        }));
    }

    futures::future::join_all(tasks).await;
    Ok(())
}

fn parse_shard(shard: &str) -> Result<(u32, u32), SyncError> {
    let (index, count) = shard
        .split_once('/')
        .ok_or_else(|| SyncError::Config(format!("invalid --shard value: {shard}")))?;
    let index: u32 = index
        .parse()
        .map_err(|_| SyncError::Config(format!("invalid --shard value: {shard}")))?;
    let count: u32 = count
        .parse()
        .map_err(|_| SyncError::Config(format!("invalid --shard value: {shard}")))?;
    if count == 0 || index >= count {
        return Err(SyncError::Config(format!("invalid --shard value: {shard}")));
    }
    Ok((index, count))
}

fn package_shard(name: &str, shard_count: u32) -> u32 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    (hasher.finish() % shard_count as u64) as u32
}

fn unix_epoch_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs() as i64
}
