use std::fmt;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

use crate::{ProtoError, ProtoResult};

static UPLOAD_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-f0-9]{64}$").expect("upload name pattern compiles"));

/// Fixed-width binary digest parsed from hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HexDigest<const N: usize>([u8; N]);

pub type Md5Digest = HexDigest<16>;
pub type Sha1Digest = HexDigest<20>;
pub type Sha256Digest = HexDigest<32>;

impl<const N: usize> HexDigest<N> {
    /// Parses a hex digest in either case. `field` names the payload field in
    /// the error.
    pub fn parse(field: &'static str, value: &str) -> ProtoResult<Self> {
        let bytes = hex::decode(value.trim()).map_err(|err| ProtoError::InvalidDigest {
            field,
            reason: err.to_string(),
        })?;
        Self::from_slice(field, &bytes)
    }

    pub fn from_slice(field: &'static str, bytes: &[u8]) -> ProtoResult<Self> {
        let raw: [u8; N] = bytes.try_into().map_err(|_| ProtoError::InvalidDigest {
            field,
            reason: format!("expected {} bytes, got {}", N, bytes.len()),
        })?;
        Ok(Self(raw))
    }

    pub const fn from_bytes(raw: [u8; N]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl<const N: usize> fmt::Display for HexDigest<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl<const N: usize> fmt::Debug for HexDigest<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HexDigest({})", self.to_hex())
    }
}

impl<const N: usize> Serialize for HexDigest<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de, const N: usize> Deserialize<'de> for HexDigest<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse("digest", &raw).map_err(de::Error::custom)
    }
}

impl Sha256Digest {
    /// Validates the declared name of an uploaded file. Unlike [`HexDigest::parse`]
    /// this only accepts exactly 64 lowercase hex characters.
    pub fn parse_upload_name(name: &str) -> ProtoResult<Self> {
        if !UPLOAD_NAME.is_match(name) {
            return Err(ProtoError::InvalidUploadName(name.to_string()));
        }
        Self::parse("upload name", name)
    }

    /// Content-addressed location: `0a8c...` is stored at `0a/8c/0a8c...`.
    pub fn content_path(&self) -> PathBuf {
        let hex = self.to_hex();
        [&hex[0..2], &hex[2..4], hex.as_str()].iter().collect()
    }

    /// Same as [`Sha256Digest::content_path`] with `/` separators on every
    /// platform, for object-store keys.
    pub fn content_key(&self) -> String {
        let hex = self.to_hex();
        format!("{}/{}/{}", &hex[0..2], &hex[2..4], hex)
    }
}
