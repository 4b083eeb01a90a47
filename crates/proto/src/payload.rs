//! Inbound request bodies.
//!
//! Agents send PascalCase JSON. Unknown keys are ignored so older and newer
//! agents can talk to the same server; digests, sizes and versions are
//! validated while decoding.

use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;

use crate::clock::correct_event_time;
use crate::digest::{Md5Digest, Sha1Digest, Sha256Digest};
use crate::job::ContentKind;
use crate::{ProtoError, ProtoResult};

const MAX_VERSION_LEN: usize = 64;

/// Decodes a request body into one of the payload types below.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> ProtoResult<T> {
    Ok(serde_json::from_slice(body)?)
}

/// Agent versions end up in update file names, so only a conservative
/// character set is accepted.
pub fn validate_version(version: &str) -> ProtoResult<&str> {
    let ok = !version.is_empty()
        && version.len() <= MAX_VERSION_LEN
        && version
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if ok {
        Ok(version)
    } else {
        Err(ProtoError::InvalidVersion(version.to_string()))
    }
}

fn non_negative<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let size = i64::deserialize(deserializer)?;
    if size < 0 {
        return Err(serde::de::Error::custom(ProtoError::NegativeSize(size)));
    }
    Ok(size)
}

/// Older agents send `""` when they could not compute a secondary digest.
fn optional_digest<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw<T> {
        Empty(EmptyString),
        Digest(T),
    }

    #[derive(Deserialize)]
    #[serde(try_from = "String")]
    struct EmptyString;

    impl TryFrom<String> for EmptyString {
        type Error = &'static str;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            if value.is_empty() {
                Ok(EmptyString)
            } else {
                Err("not empty")
            }
        }
    }

    Ok(match Option::<Raw<T>>::deserialize(deserializer)? {
        None | Some(Raw::Empty(_)) => None,
        Some(Raw::Digest(digest)) => Some(digest),
    })
}

/// The pair every agent request is resolved by. Both stay as text here: a
/// malformed UUID is reported as an unknown system, not as bad input.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentIdentity {
    #[serde(rename = "SystemUUID")]
    pub system_uuid: String,
    #[serde(rename = "CustomerUUID")]
    pub tenant_uuid: String,
}

/// Shared by every payload that carries a timestamp needing skew correction.
pub trait EventReport {
    fn identity(&self) -> &AgentIdentity;

    /// The agent's clock at the time it sent the request.
    fn agent_clock(&self) -> i64;

    /// When the reported event happened, on the agent's clock.
    fn event_time(&self) -> i64 {
        self.agent_clock()
    }

    fn corrected_time(&self, server_now: i64) -> ProtoResult<i64> {
        correct_event_time(server_now, self.agent_clock(), self.event_time())
    }
}

/// `POST /register`. The agent has no system UUID yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Registration {
    #[serde(rename = "CustomerUUID")]
    pub tenant_uuid: String,
    pub agent_version: String,
    #[serde(rename = "OSHumanName")]
    pub os_human_name: String,
    #[serde(rename = "OSVersion")]
    pub os_version: String,
    pub manufacturer: String,
    pub model: String,
    pub arch: String,
    pub machine_name: String,
    #[serde(rename = "MachineGUID")]
    pub machine_guid: String,
}

/// `POST /processEvent`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessEventReport {
    #[serde(flatten)]
    pub identity: AgentIdentity,
    pub current_client_time: i64,
    pub time_of_event: i64,
    #[serde(rename = "PID", default)]
    pub pid: i64,
    #[serde(rename = "PPID", default)]
    pub ppid: i64,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub command_line: String,
    #[serde(default, deserialize_with = "optional_digest")]
    pub md5: Option<Md5Digest>,
    #[serde(default, deserialize_with = "optional_digest")]
    pub sha1: Option<Sha1Digest>,
    pub sha256: Sha256Digest,
    #[serde(deserialize_with = "non_negative")]
    pub size: i64,
    #[serde(default)]
    pub is_signed: bool,
}

impl EventReport for ProcessEventReport {
    fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    fn agent_clock(&self) -> i64 {
        self.current_client_time
    }

    fn event_time(&self) -> i64 {
        self.time_of_event
    }
}

/// `POST /catalogFileEvent`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogFileEventReport {
    #[serde(flatten)]
    pub identity: AgentIdentity,
    pub current_client_time: i64,
    pub time_of_event: i64,
    #[serde(default)]
    pub path: String,
    pub sha256: Sha256Digest,
    #[serde(deserialize_with = "non_negative")]
    pub size: i64,
}

impl EventReport for CatalogFileEventReport {
    fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    fn agent_clock(&self) -> i64 {
        self.current_client_time
    }

    fn event_time(&self) -> i64 {
        self.time_of_event
    }
}

/// `POST /heartbeat`. The event is the heartbeat itself.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HeartbeatReport {
    #[serde(flatten)]
    pub identity: AgentIdentity,
    pub current_client_time: i64,
}

impl EventReport for HeartbeatReport {
    fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    fn agent_clock(&self) -> i64 {
        self.current_client_time
    }
}

/// `POST /getUpdate`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateRequest {
    #[serde(flatten)]
    pub identity: AgentIdentity,
    #[serde(default)]
    pub current_client_time: i64,
    pub version: String,
}

impl UpdateRequest {
    pub fn version(&self) -> ProtoResult<&str> {
        validate_version(&self.version)
    }
}

/// JSON value part of a `POST /uploadFile` form.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadMetadata {
    #[serde(flatten)]
    pub identity: AgentIdentity,
    pub file_type: String,
}

impl UploadMetadata {
    pub fn kind(&self) -> ProtoResult<ContentKind> {
        ContentKind::from_tag(&self.file_type)
    }
}
