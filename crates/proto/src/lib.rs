//! Agent protocol: the closed set of commands the server hands back, the
//! payloads agents report, and the analysis job messages put on the queue.
//!
//! Nothing in this crate performs I/O. Everything is validated on decode so
//! the server only ever works with well-formed values.

use thiserror::Error;

pub mod clock;
pub mod command;
pub mod digest;
pub mod job;
pub mod payload;

pub use clock::correct_event_time;
pub use command::{ResponseToAgent, WireCommand};
pub use digest::{HexDigest, Md5Digest, Sha1Digest, Sha256Digest};
pub use job::{AnalysisJob, ContentKind};
pub use payload::{
    decode, validate_version, AgentIdentity, CatalogFileEventReport, EventReport,
    HeartbeatReport, ProcessEventReport, Registration, UpdateRequest, UploadMetadata,
};

pub type ProtoResult<T> = Result<T, ProtoError>;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid {field}: {reason}")]
    InvalidDigest { field: &'static str, reason: String },

    #[error("upload name {0:?} is not a lowercase sha256")]
    InvalidUploadName(String),

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("invalid arguments for {command}: {reason}")]
    InvalidArguments { command: String, reason: String },

    #[error("unknown file type {0:?}")]
    UnknownFileType(String),

    #[error("invalid agent version {0:?}")]
    InvalidVersion(String),

    #[error("negative size {0}")]
    NegativeSize(i64),

    #[error("event time correction overflows (now={server_now}, clock={agent_clock}, event={event_time})")]
    ClockOverflow {
        server_now: i64,
        agent_clock: i64,
        event_time: i64,
    },
}
