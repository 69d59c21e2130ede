use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use hrsync_authority::InMemoryTransferAuthority;
use hrsync_contract::PropertyTransfer;
use hrsync_control_plane::{build_router, AppState, ServiceConfig};
use hrsync_storage::{SqliteQueueStore, StorageConfig};
use hrsync_transfer::{
    spawn_drain_loop, EngineConfig, QueueStats, RetryPolicy, TransferRecord, TransferSyncEngine,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Offline-first hand-receipt transfer sync daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the sync engine behind the HTTP control plane.
    Serve {
        #[arg(long, default_value = "config/hrsyncd.toml")]
        config: PathBuf,
    },
    /// Print the persisted queue and its counters.
    Queue {
        #[arg(long, default_value = "config/hrsyncd.toml")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct RuntimeConfig {
    http: HttpSection,
    storage: StorageSection,
    #[serde(default)]
    sync: SyncSection,
    #[serde(default)]
    authority: AuthoritySection,
}

#[derive(Debug, Clone, Deserialize)]
struct HttpSection {
    bind: String,
    auth_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StorageSection {
    sqlite_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct SyncSection {
    max_attempts: u32,
    base_delay_secs: u64,
    max_delay_secs: u64,
    backoff_multiplier: u32,
    max_queue_size: usize,
    start_online: bool,
    drain_interval_secs: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            max_attempts: engine.retry.max_attempts,
            base_delay_secs: engine.retry.base_delay.as_secs(),
            max_delay_secs: engine.retry.max_delay.as_secs(),
            backoff_multiplier: engine.retry.multiplier,
            max_queue_size: engine.max_queue_size,
            start_online: engine.start_online,
            drain_interval_secs: 60,
        }
    }
}

impl SyncSection {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_secs(self.base_delay_secs),
                max_delay: Duration::from_secs(self.max_delay_secs),
                multiplier: self.backoff_multiplier,
            },
            max_queue_size: self.max_queue_size,
            start_online: self.start_online,
            ..EngineConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AuthoritySection {
    reachable: bool,
}

impl Default for AuthoritySection {
    fn default() -> Self {
        Self { reachable: true }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => serve(config).await,
        Command::Queue { config } => print_queue(config).await,
    }
}

fn load_config(config_path: &Path) -> Result<RuntimeConfig> {
    let config_source = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read config file {}", config_path.display()))?;
    parse_config(&config_source)
        .with_context(|| format!("invalid config TOML at {}", config_path.display()))
}

fn parse_config(source: &str) -> Result<RuntimeConfig> {
    let config: RuntimeConfig = toml::from_str(source)?;
    if config.sync.max_attempts == 0 {
        return Err(anyhow!("sync.max_attempts must be at least 1"));
    }
    if config.sync.max_queue_size == 0 {
        return Err(anyhow!("sync.max_queue_size must be at least 1"));
    }
    if config.sync.drain_interval_secs == 0 {
        return Err(anyhow!("sync.drain_interval_secs must be at least 1"));
    }
    Ok(config)
}

async fn open_store(config: &RuntimeConfig) -> Result<Arc<SqliteQueueStore>> {
    let path = &config.storage.sqlite_path;
    if !path.starts_with("sqlite:") {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
    }

    let store = SqliteQueueStore::connect(&StorageConfig {
        sqlite_path: path.clone(),
    })
    .await?;
    Ok(Arc::new(store))
}

async fn serve(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let engine_config = config.sync.engine_config();

    let require_bearer = requires_token(&config.http.bind);
    if require_bearer && config.http.auth_token.is_none() {
        return Err(anyhow!(
            "non-loopback bind {} requires http.auth_token",
            config.http.bind
        ));
    }

    if !require_bearer {
        info!("loopback bind detected: bearer auth optional");
    } else {
        warn!("non-loopback bind detected: bearer auth enforced");
    }

    let store = open_store(&config).await?;
    let authority = Arc::new(InMemoryTransferAuthority::new(config.authority.reachable));
    let engine = Arc::new(
        TransferSyncEngine::<PropertyTransfer>::open(
            engine_config.clone(),
            store,
            authority.clone(),
        )
        .await
        .context("failed to load transfer queue")?,
    );

    // First tick runs after one interval; kick a drain now for leftovers.
    if engine.is_online() && engine.stats().await.total > 0 {
        let startup = Arc::clone(&engine);
        tokio::spawn(async move {
            match startup.drain().await {
                Ok(summary) => info!(
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    remaining = summary.remaining,
                    "startup drain finished"
                ),
                Err(err) => warn!(error = %err, "startup drain skipped"),
            }
        });
    }
    let drain_loop = spawn_drain_loop(
        Arc::clone(&engine),
        Duration::from_secs(config.sync.drain_interval_secs),
    );

    let service_config = ServiceConfig {
        http_bind: config.http.bind.clone(),
        http_auth_token: config.http.auth_token.clone(),
        sqlite_path: config.storage.sqlite_path.clone(),
        engine: engine_config,
    };
    let state = AppState::new(engine, authority, service_config, require_bearer);
    let app = build_router(state);

    let socket: SocketAddr = config
        .http
        .bind
        .parse()
        .with_context(|| format!("invalid socket address {}", config.http.bind))?;

    let listener = tokio::net::TcpListener::bind(socket)
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind))?;

    info!(bind = %config.http.bind, "hrsyncd control-plane listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("axum server failed");
    drain_loop.abort();
    served
}

// Read-only: a running daemon may own the same database.
async fn print_queue(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let store = open_store(&config).await?;
    let scan = store.scan::<PropertyTransfer>().await?;

    let mut items = scan.records;
    items.sort_by(TransferRecord::queue_order);
    let stats = QueueStats::from_records(&items, &config.sync.engine_config().retry);

    let report = json!({
        "stats": stats,
        "items": items,
        "corrupt": scan
            .corrupt
            .iter()
            .map(|row| json!({ "record_id": row.record_id, "reason": row.reason }))
            .collect::<Vec<_>>(),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("render queue report")?
    );
    Ok(())
}

fn requires_token(bind: &str) -> bool {
    match bind.parse::<SocketAddr>() {
        Ok(addr) => !addr.ip().is_loopback(),
        Err(_) => true,
    }
}
