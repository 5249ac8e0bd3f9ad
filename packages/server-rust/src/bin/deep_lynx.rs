//! Deep Lynx command line.
//!
//! `run` connects to storage and periodically turns staged records of every
//! active data source into nodes until interrupted. `import` stages a JSON
//! file under a new import of an existing data source, so it needs the
//! postgres backend.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use deep_lynx_core::DataSourceId;
use deep_lynx_server::service::{
    BackgroundWorker, EngineConfig, FileStoreKind, ImportCoordinator, MetatypeRegistry,
    NodeUpsertEngine, ProcessingConfig, ProcessingRunnable, ProcessingTask, ServerConfig,
    StagedRecordProcessor, StorageConfig, StorageKind, UploadConfig,
};
use deep_lynx_server::StorageHandles;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process staged records until interrupted
    Run,
    /// Stage a JSON file; an array stages one record per element (postgres only)
    Import {
        #[arg(long)]
        data_source: DataSourceId,
        #[arg(long)]
        file: PathBuf,
        /// Recorded as the import's creator
        #[arg(long, default_value = "cli")]
        user: String,
        #[arg(long, default_value = "manual upload")]
        reference: String,
    },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Deep Lynx staged record processor")]
struct Args {
    #[command(subcommand)]
    command: Command,
    /// Storage backend
    #[arg(long, value_enum, env = "DEEP_LYNX_STORAGE", default_value = "memory")]
    storage: Backend,
    /// PostgreSQL connection URL (postgres backend only)
    #[arg(long, env = "DEEP_LYNX_DATABASE_URL")]
    database_url: Option<String>,
    /// Pool size (postgres backend only)
    #[arg(long, env = "DEEP_LYNX_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,
    /// Directory uploaded files are written to. Discarded when unset.
    #[arg(long, env = "DEEP_LYNX_UPLOAD_DIR")]
    upload_dir: Option<PathBuf>,
    /// Records claimed per batch
    #[arg(long, env = "DEEP_LYNX_BATCH_SIZE", default_value_t = 100)]
    batch_size: usize,
    /// Records upserted concurrently within a batch
    #[arg(long, env = "DEEP_LYNX_CONCURRENCY", default_value_t = 8)]
    concurrency: usize,
    /// Milliseconds before an abandoned claim can be taken over
    #[arg(long, env = "DEEP_LYNX_CLAIM_TTL_MS", default_value_t = 300_000)]
    claim_ttl_ms: u64,
    /// Milliseconds between processing passes
    #[arg(long, env = "DEEP_LYNX_TICK_INTERVAL_MS", default_value_t = 60_000)]
    tick_interval_ms: u64,
    /// Let nodes adopt identifiers another node has dropped
    #[arg(long, env = "DEEP_LYNX_ALLOW_RETIRED_IDENTITIES")]
    allow_retired_identities: bool,
    /// Log output format
    #[arg(long, value_enum, env = "DEEP_LYNX_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,
    /// Serve Prometheus metrics on this address
    #[arg(long, env = "DEEP_LYNX_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

impl Args {
    /// Rejects commands that cannot work against the selected backend.
    fn check_backend(&self) -> Result<()> {
        if matches!(self.command, Command::Import { .. }) && self.storage == Backend::Memory {
            anyhow::bail!(
                "import needs a data source that already exists; \
                 use --storage postgres (the memory backend starts empty)"
            );
        }
        Ok(())
    }

    fn server_config(&self) -> Result<ServerConfig> {
        let kind = match self.storage {
            Backend::Memory => StorageKind::Memory,
            Backend::Postgres => StorageKind::Postgres {
                url: self
                    .database_url
                    .clone()
                    .context("--database-url is required for the postgres backend")?,
                max_connections: self.max_connections,
            },
        };
        let files = match &self.upload_dir {
            Some(root) => FileStoreKind::Local { root: root.clone() },
            None => FileStoreKind::Null,
        };
        Ok(ServerConfig {
            engine: EngineConfig {
                reject_retired_identities: !self.allow_retired_identities,
            },
            processing: ProcessingConfig {
                batch_size: self.batch_size,
                concurrency: self.concurrency,
                claim_ttl_ms: self.claim_ttl_ms,
                tick_interval_ms: self.tick_interval_ms,
                ..ProcessingConfig::default()
            },
            storage: StorageConfig { kind, files },
            upload: UploadConfig::default(),
        })
    }
}

fn init_logging(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format)?;
    args.check_backend()?;
    let config = args.server_config()?;

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to start metrics exporter")?;
        tracing::info!(%addr, "metrics exporter listening");
    }

    let handles = StorageHandles::connect(&config.storage)
        .await
        .context("failed to open storage")?;

    let result = match args.command {
        Command::Run => run(&handles, &config).await,
        Command::Import {
            data_source,
            file,
            user,
            reference,
        } => import(&handles, &config, data_source, &file, &user, &reference).await,
    };
    handles.backend.close().await?;
    result
}

async fn run(handles: &StorageHandles, config: &ServerConfig) -> Result<()> {
    let registry = Arc::new(MetatypeRegistry::new(Arc::clone(&handles.metatypes)));
    let engine = Arc::new(NodeUpsertEngine::new(
        Arc::clone(&handles.graphs),
        Arc::clone(&handles.nodes),
        registry,
        config.engine.clone(),
    ));
    let processor = Arc::new(StagedRecordProcessor::new(
        handles,
        engine,
        config.processing.clone(),
    ));
    let mut worker = BackgroundWorker::start(
        ProcessingRunnable::new(processor),
        config.processing.tick_interval_ms,
    );

    worker
        .submit(ProcessingTask::AllActive)
        .await
        .context("processing worker exited early")?;
    tracing::info!(
        worker_id = %config.processing.worker_id,
        tick_interval_ms = config.processing.tick_interval_ms,
        "deep lynx processor running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    worker.stop().await;
    Ok(())
}

async fn import(
    handles: &StorageHandles,
    config: &ServerConfig,
    data_source_id: DataSourceId,
    file: &Path,
    user: &str,
    reference: &str,
) -> Result<()> {
    let raw = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let payload: serde_json::Value = serde_json::from_slice(&raw)
        .with_context(|| format!("{} is not valid JSON", file.display()))?;

    let coordinator = ImportCoordinator::new(handles, config.upload.clone());
    let report = coordinator
        .initiate_import(data_source_id, user, reference, Some(payload))
        .await?;
    tracing::info!(
        import_id = %report.import.id,
        staged = report.staged.len(),
        "import staged"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
