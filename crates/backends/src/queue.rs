use std::collections::VecDeque;
use std::time::Duration;

use async_nats::jetstream::{self, stream};
use async_trait::async_trait;
use callback_proto::{AnalysisJob, ContentKind, ProtoError};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("cannot reach queue at {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("cannot declare queue {queue}: {reason}")]
    Declare { queue: &'static str, reason: String },

    #[error("publish to {queue} failed: {reason}")]
    Publish { queue: &'static str, reason: String },

    #[error("cannot encode job: {0}")]
    Encode(#[from] ProtoError),
}

/// Durable hand-off of analysis jobs to the worker pool.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Makes sure every per-kind queue exists and survives restarts.
    async fn declare(&self) -> QueueResult<()>;

    /// Returns once the queue has durably accepted the job.
    async fn publish(&self, job: &AnalysisJob) -> QueueResult<()>;
}

/// NATS JetStream, one file-backed stream per content kind. The stream and
/// its subject share the queue name.
#[derive(Clone)]
pub struct NatsQueue {
    jetstream: jetstream::Context,
}

impl NatsQueue {
    pub async fn connect(url: &str) -> QueueResult<Self> {
        let connect_error = |reason: String| QueueError::Connect {
            url: url.to_string(),
            reason,
        };
        let client = timeout(CONNECT_TIMEOUT, async_nats::connect(url))
            .await
            .map_err(|_| connect_error(format!("timed out after {CONNECT_TIMEOUT:?}")))?
            .map_err(|err| connect_error(err.to_string()))?;
        info!(%url, "connected to nats");
        Ok(Self {
            jetstream: jetstream::new(client),
        })
    }
}

#[async_trait]
impl JobQueue for NatsQueue {
    async fn declare(&self) -> QueueResult<()> {
        for kind in ContentKind::ALL {
            let queue = kind.queue_name();
            self.jetstream
                .get_or_create_stream(stream::Config {
                    name: queue.to_string(),
                    subjects: vec![queue.to_string()],
                    storage: stream::StorageType::File,
                    retention: stream::RetentionPolicy::WorkQueue,
                    ..Default::default()
                })
                .await
                .map_err(|err| QueueError::Declare {
                    queue,
                    reason: err.to_string(),
                })?;
            debug!(queue, "queue declared");
        }
        Ok(())
    }

    async fn publish(&self, job: &AnalysisJob) -> QueueResult<()> {
        let queue = job.queue_name();
        let payload = job.to_payload()?;
        let publish_error = |reason: String| QueueError::Publish { queue, reason };

        let ack = self
            .jetstream
            .publish(queue, payload.into())
            .await
            .map_err(|err| publish_error(err.to_string()))?;
        ack.await.map_err(|err| publish_error(err.to_string()))?;

        debug!(queue, content_id = job.content_id(), "analysis job published");
        Ok(())
    }
}

/// Jobs a [`LocalQueue`] remembers before dropping the oldest.
pub const LOCAL_QUEUE_RETAINED: usize = 1024;

/// In-process queue for development and tests. Jobs go nowhere; only the
/// most recent ones are kept for inspection.
pub struct LocalQueue {
    published: Mutex<VecDeque<AnalysisJob>>,
    retained: usize,
    unavailable: Mutex<bool>,
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::with_retention(LOCAL_QUEUE_RETAINED)
    }
}

impl LocalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retained: usize) -> Self {
        Self {
            published: Mutex::new(VecDeque::new()),
            retained: retained.max(1),
            unavailable: Mutex::new(false),
        }
    }

    /// Retained jobs, oldest first.
    pub async fn published(&self) -> Vec<AnalysisJob> {
        self.published.lock().await.iter().copied().collect()
    }

    /// Simulates an outage: every publish fails until switched back.
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().await = unavailable;
    }
}

#[async_trait]
impl JobQueue for LocalQueue {
    async fn declare(&self) -> QueueResult<()> {
        Ok(())
    }

    async fn publish(&self, job: &AnalysisJob) -> QueueResult<()> {
        if *self.unavailable.lock().await {
            return Err(QueueError::Publish {
                queue: job.queue_name(),
                reason: "local queue marked unavailable".to_string(),
            });
        }
        let mut published = self.published.lock().await;
        if published.len() == self.retained {
            published.pop_front();
        }
        published.push_back(*job);
        Ok(())
    }
}
