//! External collaborators of the callback server: where verified blobs are
//! stored and where analysis jobs are handed off. The server only sees the
//! [`BlobStore`] and [`JobQueue`] traits.

pub mod blob;
pub mod queue;

pub use blob::{BlobError, BlobResult, BlobStore, FsBlobStore, S3BlobStore};
pub use queue::{JobQueue, LocalQueue, NatsQueue, QueueError, QueueResult};
