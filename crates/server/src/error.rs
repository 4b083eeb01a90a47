use std::fmt;
use std::io;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use callback_backends::{BlobError, QueueError};
use callback_proto::{ContentKind, ProtoError, Sha256Digest};
use callback_store::StoreError;
use thiserror::Error;
use tracing::{error, warn};

pub type CallbackResult<T> = Result<T, CallbackError>;

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("unknown system or tenant")]
    NotFound,

    #[error("no {kind} content registered for {sha256}")]
    UnknownBinary {
        kind: ContentKind,
        sha256: Sha256Digest,
    },

    #[error("upload named {claimed} hashes to {actual}")]
    IntegrityMismatch {
        claimed: Sha256Digest,
        actual: Sha256Digest,
    },

    #[error("upload is {actual} bytes, {expected} were reported")]
    SizeMismatch { expected: i64, actual: i64 },

    #[error("dependency failure: {reason}")]
    DependencyFailure { reason: String, analysis_gap: bool },
}

impl CallbackError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedInput(reason.into())
    }

    pub fn dependency(reason: impl ToString) -> Self {
        Self::DependencyFailure {
            reason: reason.to_string(),
            analysis_gap: false,
        }
    }

    /// Caused by what the agent sent rather than by our own infrastructure.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::DependencyFailure { .. })
    }

    fn analysis_gap(&self) -> bool {
        matches!(
            self,
            Self::DependencyFailure {
                analysis_gap: true,
                ..
            }
        )
    }
}

impl From<ProtoError> for CallbackError {
    fn from(err: ProtoError) -> Self {
        Self::MalformedInput(err.to_string())
    }
}

impl From<StoreError> for CallbackError {
    fn from(err: StoreError) -> Self {
        Self::dependency(err)
    }
}

impl From<BlobError> for CallbackError {
    fn from(err: BlobError) -> Self {
        Self::dependency(err)
    }
}

impl From<QueueError> for CallbackError {
    fn from(err: QueueError) -> Self {
        Self::dependency(err)
    }
}

impl From<io::Error> for CallbackError {
    fn from(err: io::Error) -> Self {
        Self::dependency(err)
    }
}

/// Where in the request lifecycle a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Decoding,
    ResolvingIdentity,
    ProcessingEvent,
    SelectingResponse,
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestPhase::Decoding => "decoding",
            RequestPhase::ResolvingIdentity => "resolving_identity",
            RequestPhase::ProcessingEvent => "processing_event",
            RequestPhase::SelectingResponse => "selecting_response",
        })
    }
}

/// A request that ended in the error state. Every rejection looks the same
/// to the agent: 400 and an empty body.
#[derive(Debug)]
pub struct Rejection {
    pub phase: RequestPhase,
    pub error: CallbackError,
}

impl Rejection {
    pub fn log(&self) {
        let phase = self.phase;
        let error = &self.error;
        if error.analysis_gap() {
            error!(%phase, analysis_gap = true, %error, "stored content was not queued for analysis");
        } else if error.is_client_error() {
            warn!(%phase, %error, "request rejected");
        } else {
            error!(%phase, %error, "request failed");
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        self.log();
        StatusCode::BAD_REQUEST.into_response()
    }
}

/// Tags an error with the phase it occurred in.
pub trait InPhase<T> {
    fn during(self, phase: RequestPhase) -> Result<T, Rejection>;
}

impl<T, E: Into<CallbackError>> InPhase<T> for Result<T, E> {
    fn during(self, phase: RequestPhase) -> Result<T, Rejection> {
        self.map_err(|err| Rejection {
            phase,
            error: err.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_rejection_is_an_empty_400() {
        let rejections = [
            CallbackError::malformed("bad json"),
            CallbackError::NotFound,
            CallbackError::SizeMismatch {
                expected: 1,
                actual: 2,
            },
            CallbackError::DependencyFailure {
                reason: "queue down".into(),
                analysis_gap: true,
            },
        ];
        for error in rejections {
            let response = Rejection {
                phase: RequestPhase::ProcessingEvent,
                error,
            }
            .into_response();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
            assert!(body.is_empty());
        }
    }

    #[test]
    fn lower_layer_errors_map_to_the_taxonomy() {
        let err: CallbackError = ProtoError::UnknownFileType("dll".into()).into();
        assert!(matches!(err, CallbackError::MalformedInput(_)));
        assert!(err.is_client_error());

        let err: CallbackError = io::Error::other("disk full").into();
        assert!(matches!(
            err,
            CallbackError::DependencyFailure {
                analysis_gap: false,
                ..
            }
        ));
        assert!(!err.is_client_error());
    }

    #[test]
    fn phase_is_attached() {
        let result: Result<(), CallbackError> = Err(CallbackError::NotFound);
        let rejection = result.during(RequestPhase::ResolvingIdentity).unwrap_err();
        assert_eq!(rejection.phase, RequestPhase::ResolvingIdentity);
        assert_eq!(rejection.phase.to_string(), "resolving_identity");
    }
}
