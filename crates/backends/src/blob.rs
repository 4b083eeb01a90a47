use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use callback_proto::{ContentKind, Sha256Digest};
use thiserror::Error;
use tracing::{debug, info};

pub type BlobResult<T> = Result<T, BlobError>;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("s3 {operation} {bucket}/{key} failed: {reason}")]
    S3 {
        operation: &'static str,
        bucket: String,
        key: String,
        reason: String,
    },
}

/// Content-addressed storage. Objects are keyed by kind and digest; the
/// digest is expanded to `ab/cd/abcd...` by the implementations.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores the file at `source` under `sha256`. Overwrites are harmless
    /// since the content is identical by construction.
    async fn put_file(
        &self,
        kind: ContentKind,
        sha256: &Sha256Digest,
        source: &Path,
    ) -> BlobResult<()>;

    async fn get(&self, kind: ContentKind, sha256: &Sha256Digest) -> BlobResult<Option<Bytes>>;

    async fn exists(&self, kind: ContentKind, sha256: &Sha256Digest) -> BlobResult<bool>;
}

/// Local directory tree, one sub-directory per content kind.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, kind: ContentKind, sha256: &Sha256Digest) -> PathBuf {
        self.root.join(kind.tag()).join(sha256.content_path())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put_file(
        &self,
        kind: ContentKind,
        sha256: &Sha256Digest,
        source: &Path,
    ) -> BlobResult<()> {
        let dest = self.path_for(kind, sha256);
        let source = source.to_path_buf();
        debug!(dest = %dest.display(), "storing blob");

        // Write next to the destination, then rename: readers never observe a
        // partially written object.
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let parent = dest
                .parent()
                .ok_or_else(|| io::Error::other("blob path has no parent"))?;
            std::fs::create_dir_all(parent)?;
            let mut staged = tempfile::NamedTempFile::new_in(parent)?;
            let mut input = std::fs::File::open(&source)?;
            io::copy(&mut input, staged.as_file_mut())?;
            staged.as_file().sync_all()?;
            staged.persist(&dest).map_err(|err| err.error)?;
            Ok(())
        })
        .await
        .map_err(io::Error::other)??;
        Ok(())
    }

    async fn get(&self, kind: ContentKind, sha256: &Sha256Digest) -> BlobResult<Option<Bytes>> {
        match tokio::fs::read(self.path_for(kind, sha256)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, kind: ContentKind, sha256: &Sha256Digest) -> BlobResult<bool> {
        Ok(tokio::fs::try_exists(self.path_for(kind, sha256)).await?)
    }
}

/// Private S3 buckets, one per content kind.
#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    exe_bucket: String,
    catalog_bucket: String,
}

impl S3BlobStore {
    /// Builds a client from the ambient AWS configuration (environment,
    /// profile or instance role).
    pub async fn new(exe_bucket: String, catalog_bucket: String) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        info!(%exe_bucket, %catalog_bucket, "s3 blob store configured");
        Self::with_client(Client::new(&config), exe_bucket, catalog_bucket)
    }

    pub fn with_client(client: Client, exe_bucket: String, catalog_bucket: String) -> Self {
        Self {
            client,
            exe_bucket,
            catalog_bucket,
        }
    }

    fn bucket(&self, kind: ContentKind) -> &str {
        match kind {
            ContentKind::Executable => &self.exe_bucket,
            ContentKind::Catalog => &self.catalog_bucket,
        }
    }

    fn error(
        &self,
        operation: &'static str,
        kind: ContentKind,
        key: &str,
        reason: impl ToString,
    ) -> BlobError {
        BlobError::S3 {
            operation,
            bucket: self.bucket(kind).to_string(),
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put_file(
        &self,
        kind: ContentKind,
        sha256: &Sha256Digest,
        source: &Path,
    ) -> BlobResult<()> {
        let key = sha256.content_key();
        let body = ByteStream::from_path(source)
            .await
            .map_err(|err| self.error("put", kind, &key, err))?;

        self.client
            .put_object()
            .bucket(self.bucket(kind))
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|err| self.error("put", kind, &key, err))?;

        debug!(bucket = self.bucket(kind), %key, "blob stored");
        Ok(())
    }

    async fn get(&self, kind: ContentKind, sha256: &Sha256Digest) -> BlobResult<Option<Bytes>> {
        let key = sha256.content_key();
        let output = match self
            .client
            .get_object()
            .bucket(self.bucket(kind))
            .key(&key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_no_such_key() {
                    return Ok(None);
                }
                return Err(self.error("get", kind, &key, service_error));
            }
        };

        let data = output
            .body
            .collect()
            .await
            .map_err(|err| self.error("get", kind, &key, err))?;
        Ok(Some(data.into_bytes()))
    }

    async fn exists(&self, kind: ContentKind, sha256: &Sha256Digest) -> BlobResult<bool> {
        let key = sha256.content_key();
        match self
            .client
            .head_object()
            .bucket(self.bucket(kind))
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(self.error("head", kind, &key, service_error))
                }
            }
        }
    }
}
