//! Content-addressed file intake.
//!
//! Two entry points: [`FileIntake::register_sighting`] when an agent reports
//! a file by digest, and the scratch/verify/store pipeline when it uploads
//! the bytes. A blob is only stored after its digest was recomputed here.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use callback_backends::BlobStore;
use callback_proto::{ContentKind, Sha256Digest};
use callback_store::{NewContent, Registered, Store, SystemId};
use sha2::{Digest, Sha256};
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::dispatch::AnalysisDispatcher;
use crate::error::{CallbackError, CallbackResult};

#[derive(Debug, Clone)]
pub struct IntakeSettings {
    pub scratch_dir: PathBuf,
    pub max_bytes: u64,
}

/// Upload bytes being written to the scratch directory. Dropped before
/// [`ScratchFile::finish`], the partial file is removed.
pub struct ScratchFile {
    file: File,
    path: TempPath,
    written: u64,
    max_bytes: u64,
}

impl ScratchFile {
    pub async fn write(&mut self, chunk: &[u8]) -> CallbackResult<()> {
        let written = self.written + chunk.len() as u64;
        if written > self.max_bytes {
            return Err(CallbackError::malformed(format!(
                "upload exceeds {} bytes",
                self.max_bytes
            )));
        }
        self.file.write_all(chunk).await?;
        self.written = written;
        Ok(())
    }

    /// Flushes to disk and hands over the file. From here on the scratch copy
    /// outlives any failure.
    pub async fn finish(mut self) -> CallbackResult<PersistedUpload> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        let path = self.path.keep().map_err(|err| err.error)?;
        Ok(PersistedUpload {
            path,
            size: self.written,
        })
    }
}

/// Upload bytes fully written to scratch.
#[derive(Debug)]
pub struct PersistedUpload {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Clone)]
pub struct FileIntake {
    store: Store,
    blobs: Arc<dyn BlobStore>,
    dispatcher: AnalysisDispatcher,
    settings: IntakeSettings,
}

impl FileIntake {
    pub fn new(
        store: Store,
        blobs: Arc<dyn BlobStore>,
        dispatcher: AnalysisDispatcher,
        settings: IntakeSettings,
    ) -> Self {
        Self {
            store,
            blobs,
            dispatcher,
            settings,
        }
    }

    pub fn settings(&self) -> &IntakeSettings {
        &self.settings
    }

    /// Records a reported file. A digest seen for the first time gets a
    /// fetch task for the reporting agent; known digests are left alone.
    pub async fn register_sighting(
        &self,
        system: SystemId,
        content: &NewContent<'_>,
        now: i64,
    ) -> CallbackResult<Registered> {
        let fetch = content.kind.fetch_command(content.sha256);
        let registered = self
            .store
            .register_content_with_fetch(system, content, &fetch, now)
            .await?;
        if registered.created {
            info!(
                %system,
                kind = %content.kind,
                sha256 = %content.sha256,
                "new content, fetch requested"
            );
        }
        Ok(registered)
    }

    /// Opens a scratch file for an upload claiming `claimed`.
    pub async fn scratch(&self, claimed: &Sha256Digest) -> CallbackResult<ScratchFile> {
        tokio::fs::create_dir_all(&self.settings.scratch_dir).await?;
        let named = tempfile::Builder::new()
            .prefix(&format!("{}-", claimed.to_hex()))
            .tempfile_in(&self.settings.scratch_dir)?;
        let (file, path) = named.into_parts();
        Ok(ScratchFile {
            file: File::from_std(file),
            path,
            written: 0,
            max_bytes: self.settings.max_bytes,
        })
    }

    /// Verifies and stores a persisted upload, then hands it to analysis. The
    /// scratch copy is removed only when every step succeeded.
    pub async fn complete_upload(
        &self,
        system: SystemId,
        kind: ContentKind,
        claimed: Sha256Digest,
        upload: PersistedUpload,
        now: i64,
    ) -> CallbackResult<()> {
        match self.verify_and_store(kind, claimed, &upload, now).await {
            Ok(()) => {
                if let Err(err) = tokio::fs::remove_file(&upload.path).await {
                    warn!(scratch = %upload.path.display(), %err, "could not remove scratch file");
                }
                Ok(())
            }
            Err(err) => {
                info!(
                    %system,
                    scratch = %upload.path.display(),
                    "upload not completed, scratch file retained"
                );
                Err(err)
            }
        }
    }

    async fn verify_and_store(
        &self,
        kind: ContentKind,
        claimed: Sha256Digest,
        upload: &PersistedUpload,
        now: i64,
    ) -> CallbackResult<()> {
        let actual = hash_file(&upload.path).await?;
        if actual != claimed {
            return Err(CallbackError::IntegrityMismatch { claimed, actual });
        }

        let record = self
            .store
            .find_content(kind, &claimed)
            .await?
            .ok_or(CallbackError::UnknownBinary {
                kind,
                sha256: claimed,
            })?;

        let actual_size = i64::try_from(upload.size)
            .map_err(|_| CallbackError::malformed("upload size out of range"))?;
        if actual_size != record.size {
            return Err(CallbackError::SizeMismatch {
                expected: record.size,
                actual: actual_size,
            });
        }

        if record.uploaded_at.is_none() {
            self.blobs.put_file(kind, &claimed, &upload.path).await?;
            self.store.mark_uploaded(kind, record.id, now).await?;
            info!(%kind, sha256 = %claimed, content_id = record.id, "content stored");
        } else {
            debug!(%kind, sha256 = %claimed, "content already stored, skipping put");
        }

        if record.queued_at.is_none() {
            self.dispatcher.dispatch(kind, record.id, now).await?;
        }
        Ok(())
    }
}

/// SHA-256 of a file on disk, computed off the async runtime.
pub async fn hash_file(path: &Path) -> CallbackResult<Sha256Digest> {
    let path = path.to_path_buf();
    let digest = tokio::task::spawn_blocking(move || -> io::Result<[u8; 32]> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(hasher.finalize().into())
    })
    .await
    .map_err(io::Error::other)??;
    Ok(Sha256Digest::from_bytes(digest))
}
