use std::sync::Arc;

use callback_backends::JobQueue;
use callback_proto::{AnalysisJob, ContentKind};
use callback_store::Store;
use tracing::{debug, warn};

use crate::error::{CallbackError, CallbackResult};

/// Hands stored content to the analysis workers.
#[derive(Clone)]
pub struct AnalysisDispatcher {
    store: Store,
    queue: Arc<dyn JobQueue>,
}

impl AnalysisDispatcher {
    pub fn new(store: Store, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }

    /// Publishes a job for a stored content row and records the hand-off.
    ///
    /// Only call this once the blob is durably stored. A failed publish leaves
    /// `queued_at` unset so the next correct upload of the same content
    /// publishes again.
    pub async fn dispatch(&self, kind: ContentKind, content_id: i64, now: i64) -> CallbackResult<()> {
        let job = AnalysisJob::new(kind, content_id);
        if let Err(err) = self.queue.publish(&job).await {
            warn!(queue = job.queue_name(), content_id, "publish failed, hand-off left pending");
            return Err(CallbackError::DependencyFailure {
                reason: err.to_string(),
                analysis_gap: true,
            });
        }

        if !self.store.mark_queued(kind, content_id, now).await? {
            debug!(%kind, content_id, "content was already marked queued");
        }
        Ok(())
    }
}
