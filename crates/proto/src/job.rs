use std::fmt;

use serde::{Deserialize, Serialize};

use crate::command::ResponseToAgent;
use crate::digest::Sha256Digest;
use crate::{ProtoError, ProtoResult};

/// The two families of content agents report and upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Executable,
    Catalog,
}

impl ContentKind {
    pub const ALL: [ContentKind; 2] = [ContentKind::Executable, ContentKind::Catalog];

    /// Parses the `FileType` tag of an upload form.
    pub fn from_tag(tag: &str) -> ProtoResult<Self> {
        match tag {
            "exe" => Ok(ContentKind::Executable),
            "catalog" => Ok(ContentKind::Catalog),
            other => Err(ProtoError::UnknownFileType(other.to_string())),
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            ContentKind::Executable => "exe",
            ContentKind::Catalog => "catalog",
        }
    }

    /// Durable queue analysis jobs of this kind are published to.
    pub fn queue_name(self) -> &'static str {
        match self {
            ContentKind::Executable => "analyzefile",
            ContentKind::Catalog => "analyzecatalog",
        }
    }

    /// Instruction asking an agent to upload content of this kind.
    pub fn fetch_command(self, sha256: Sha256Digest) -> ResponseToAgent {
        match self {
            ContentKind::Executable => ResponseToAgent::GetFileByHash { sha256 },
            ContentKind::Catalog => ResponseToAgent::GetCatalogFileByHash { sha256 },
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Queue message handed to the analysis workers. It only references the
/// stored row; workers fetch the blob themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnalysisJob {
    Executable {
        #[serde(rename = "FileID")]
        file_id: i64,
    },
    Catalog {
        #[serde(rename = "CatalogID")]
        catalog_id: i64,
    },
}

impl AnalysisJob {
    pub fn new(kind: ContentKind, content_id: i64) -> Self {
        match kind {
            ContentKind::Executable => AnalysisJob::Executable {
                file_id: content_id,
            },
            ContentKind::Catalog => AnalysisJob::Catalog {
                catalog_id: content_id,
            },
        }
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            AnalysisJob::Executable { .. } => ContentKind::Executable,
            AnalysisJob::Catalog { .. } => ContentKind::Catalog,
        }
    }

    pub fn content_id(&self) -> i64 {
        match *self {
            AnalysisJob::Executable { file_id } => file_id,
            AnalysisJob::Catalog { catalog_id } => catalog_id,
        }
    }

    pub fn queue_name(&self) -> &'static str {
        self.kind().queue_name()
    }

    pub fn to_payload(&self) -> ProtoResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_serialise_to_worker_message_shape() {
        let exe = AnalysisJob::new(ContentKind::Executable, 42);
        assert_eq!(exe.to_payload().unwrap(), br#"{"FileID":42}"#);
        assert_eq!(exe.queue_name(), "analyzefile");

        let catalog = AnalysisJob::new(ContentKind::Catalog, 7);
        assert_eq!(catalog.to_payload().unwrap(), br#"{"CatalogID":7}"#);
        assert_eq!(catalog.queue_name(), "analyzecatalog");
    }

    #[test]
    fn worker_side_decode_recovers_kind() {
        let job: AnalysisJob = serde_json::from_str(r#"{"CatalogID":7}"#).unwrap();
        assert_eq!(job.kind(), ContentKind::Catalog);
        assert_eq!(job.content_id(), 7);
    }

    #[test]
    fn file_type_tags() {
        for kind in ContentKind::ALL {
            assert_eq!(ContentKind::from_tag(kind.tag()).unwrap(), kind);
        }
        assert!(ContentKind::from_tag("executable").is_err());
        assert!(ContentKind::from_tag("EXE").is_err());
    }

    #[test]
    fn fetch_command_matches_kind() {
        let sha256 = Sha256Digest::from_bytes([0xab; 32]);
        assert_eq!(
            ContentKind::Catalog.fetch_command(sha256).name(),
            "GetCatalogFileByHash"
        );
        assert_eq!(
            ContentKind::Executable.fetch_command(sha256).name(),
            "GetFileByHash"
        );
    }
}
