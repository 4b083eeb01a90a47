use std::{io, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use callback_backends::{BlobStore, FsBlobStore, JobQueue, LocalQueue, NatsQueue, S3BlobStore};
use callback_server::{
    config::{self, BlobConfig, CliOverrides, QueueConfig, ServerConfig},
    intake::IntakeSettings,
    run_http, CallbackServer,
};
use callback_store::Store;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "callback-server", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Path to the TOML configuration file
    #[arg(
        long = "config",
        value_name = "FILE",
        env = "CALLBACK_CONFIG",
        default_value = "callback.toml"
    )]
    config_path: PathBuf,

    /// Optional log filter (e.g. info, debug, callback_store=trace)
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log line format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Bind address
    #[arg(long = "host", value_name = "HOST")]
    host: Option<String>,

    /// Bind port
    #[arg(long = "port", value_name = "PORT")]
    port: Option<u16>,

    /// SQLite database URL
    #[arg(long = "database-url", value_name = "URL")]
    database_url: Option<String>,

    /// Directory uploads are staged in before verification
    #[arg(long = "scratch-dir", value_name = "PATH")]
    scratch_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(&args);
    tracing::info!(
        "{}",
        callback_build_info::formatted_banner("callback-server", SERVER_VERSION)
    );

    let file_cfg = config::load_file_config(&args.config_path)?;
    if file_cfg.is_none() {
        tracing::info!(
            "no config at {}, using defaults",
            args.config_path.display()
        );
    }
    let cli = CliOverrides {
        host: args.host.clone(),
        port: args.port,
        database_url: args.database_url.clone(),
        scratch_dir: args.scratch_dir.clone(),
    };
    let config = config::resolve_config(&cli, file_cfg.as_ref())?;

    let store = Store::open(&config.database.url, config.database.max_connections)
        .await
        .with_context(|| format!("Failed to open store at {}", config.database.url))?;

    let blobs = build_blob_store(&config).await;
    let queue = build_queue(&config).await?;
    queue
        .declare()
        .await
        .context("Failed to declare analysis queues")?;

    tokio::fs::create_dir_all(&config.upload.scratch_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create scratch directory {}",
                config.upload.scratch_dir.display()
            )
        })?;

    let ServerConfig {
        http,
        upload,
        updates_dir,
        ..
    } = config;
    let server = Arc::new(CallbackServer::new(
        store.clone(),
        blobs,
        queue,
        IntakeSettings {
            scratch_dir: upload.scratch_dir,
            max_bytes: upload.max_bytes,
        },
        updates_dir,
    ));

    let result = run_http(server, http, shutdown_signal()).await;
    store.close().await;
    tracing::info!("callback server stopped");
    result
}

fn init_tracing(args: &Args) {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr);

    let _ = match args.log_format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

async fn build_blob_store(config: &ServerConfig) -> Arc<dyn BlobStore> {
    let blobs: Arc<dyn BlobStore> = match &config.blob {
        BlobConfig::Fs { root } => {
            tracing::info!("storing blobs under {}", root.display());
            Arc::new(FsBlobStore::new(root.clone()))
        }
        BlobConfig::S3 {
            exe_bucket,
            catalog_bucket,
        } => Arc::new(S3BlobStore::new(exe_bucket.clone(), catalog_bucket.clone()).await),
    };
    blobs
}

async fn build_queue(config: &ServerConfig) -> Result<Arc<dyn JobQueue>> {
    let queue: Arc<dyn JobQueue> = match &config.queue {
        QueueConfig::Nats { url } => Arc::new(NatsQueue::connect(url).await?),
        QueueConfig::Local => {
            tracing::warn!("using the in-process queue; analysis jobs will not leave this process");
            Arc::new(LocalQueue::new())
        }
    };
    Ok(queue)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown requested, draining in-flight requests");
}
