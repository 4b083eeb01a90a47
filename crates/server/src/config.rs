use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Matches the upload cap agents were built against.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub upload: UploadConfig,
    pub blob: BlobConfig,
    pub queue: QueueConfig,
    pub updates_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    pub scratch_dir: PathBuf,
    pub max_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobConfig {
    Fs {
        root: PathBuf,
    },
    S3 {
        exe_bucket: String,
        catalog_bucket: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueConfig {
    Nats { url: String },
    Local,
}

#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database_url: Option<String>,
    pub scratch_dir: Option<PathBuf>,
}

/// Parsed config file with relative paths already anchored at the file's
/// directory.
#[derive(Debug, Default, Clone)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database_url: Option<String>,
    pub max_connections: Option<u32>,
    pub scratch_dir: Option<PathBuf>,
    pub max_upload_bytes: Option<u64>,
    pub blob: Option<BlobConfig>,
    pub queue: Option<QueueConfig>,
    pub updates_dir: Option<PathBuf>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    server: RawServer,
    #[serde(default)]
    database: RawDatabase,
    #[serde(default)]
    upload: RawUpload,
    blob: Option<RawBlob>,
    queue: Option<RawQueue>,
    #[serde(default)]
    updates: RawUpdates,
}

#[derive(Deserialize, Default)]
struct RawServer {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Deserialize, Default)]
struct RawDatabase {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Deserialize, Default)]
struct RawUpload {
    scratch_dir: Option<String>,
    max_bytes: Option<u64>,
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum RawBlob {
    Fs { root: String },
    S3 { exe_bucket: String, catalog_bucket: String },
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum RawQueue {
    Nats { url: String },
    Local,
}

#[derive(Deserialize, Default)]
struct RawUpdates {
    dir: Option<String>,
}

/// Reads the TOML config at `path`. A missing file is not an error.
pub fn load_file_config(path: &Path) -> Result<Option<FileConfig>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let raw: RawConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML config {}", path.display()))?;

    Ok(Some(
        raw.into_file_config(path.parent().unwrap_or(Path::new("."))),
    ))
}

/// Merges CLI flags over the config file over built-in defaults.
pub fn resolve_config(cli: &CliOverrides, file_cfg: Option<&FileConfig>) -> Result<ServerConfig> {
    let host = cli
        .host
        .clone()
        .or_else(|| file_cfg.and_then(|cfg| cfg.host.clone()))
        .unwrap_or_else(|| "0.0.0.0".to_string());

    let port = cli
        .port
        .or_else(|| file_cfg.and_then(|cfg| cfg.port))
        .unwrap_or(8080);

    let database_url = cli
        .database_url
        .clone()
        .or_else(|| file_cfg.and_then(|cfg| cfg.database_url.clone()))
        .unwrap_or_else(|| "sqlite://callback.db".to_string());

    let max_connections = file_cfg
        .and_then(|cfg| cfg.max_connections)
        .unwrap_or(8);
    if max_connections == 0 {
        bail!("database.max_connections must be at least 1");
    }

    let scratch_dir = cli
        .scratch_dir
        .clone()
        .or_else(|| file_cfg.and_then(|cfg| cfg.scratch_dir.clone()))
        .unwrap_or_else(|| PathBuf::from("uploads"));

    let max_bytes = file_cfg
        .and_then(|cfg| cfg.max_upload_bytes)
        .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);
    if max_bytes == 0 {
        bail!("upload.max_bytes must be at least 1");
    }

    let blob = file_cfg
        .and_then(|cfg| cfg.blob.clone())
        .unwrap_or_else(|| BlobConfig::Fs {
            root: PathBuf::from("blobs"),
        });

    let queue = file_cfg
        .and_then(|cfg| cfg.queue.clone())
        .unwrap_or_else(|| QueueConfig::Nats {
            url: "nats://127.0.0.1:4222".to_string(),
        });

    let updates_dir = file_cfg
        .and_then(|cfg| cfg.updates_dir.clone())
        .unwrap_or_else(|| PathBuf::from("updates"));

    Ok(ServerConfig {
        http: HttpConfig { host, port },
        database: DatabaseConfig {
            url: database_url,
            max_connections,
        },
        upload: UploadConfig {
            scratch_dir,
            max_bytes,
        },
        blob,
        queue,
        updates_dir,
    })
}


fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

impl RawConfig {
    fn into_file_config(self, base: &Path) -> FileConfig {
        let anchor = |value: String| resolve_relative(base, Path::new(&value));

        FileConfig {
            host: self.server.host,
            port: self.server.port,
            database_url: self.database.url,
            max_connections: self.database.max_connections,
            scratch_dir: self.upload.scratch_dir.map(anchor),
            max_upload_bytes: self.upload.max_bytes,
            blob: self.blob.map(|raw| match raw {
                RawBlob::Fs { root } => BlobConfig::Fs { root: anchor(root) },
                RawBlob::S3 {
                    exe_bucket,
                    catalog_bucket,
                } => BlobConfig::S3 {
                    exe_bucket,
                    catalog_bucket,
                },
            }),
            queue: self.queue.map(|raw| match raw {
                RawQueue::Nats { url } => QueueConfig::Nats { url },
                RawQueue::Local => QueueConfig::Local,
            }),
            updates_dir: self.updates.dir.map(anchor),
        }
    }
}
