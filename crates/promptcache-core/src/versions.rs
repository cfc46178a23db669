//! Sibling-version list codec.
//!
//! A canonical blob that has accumulated alternate-parent versions carries
//! them in its `additionalversions` metadata value:
//!
//! ```text
//! [{"hash":"12","parentHash":"0","location":"guid-a"},
//!  {"hash":"19","parentHash":"7","location":"guid-b"}]
//! ```
//!
//! Hashes are serialized as decimal strings (blob metadata is text-only and
//! some tooling mangles bare 64-bit numbers). List order is insertion
//! order, which the write path uses as its FIFO eviction queue - parsing
//! and serializing must never reorder entries.

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, Result};
use crate::types::BlockHash;

/// One sibling version record referenced from a canonical blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockVersion {
    #[serde(with = "u64_string")]
    pub hash: BlockHash,
    #[serde(rename = "parentHash", with = "u64_string")]
    pub parent_hash: BlockHash,
    pub location: String,
}

impl BlockVersion {
    pub fn new(hash: BlockHash, parent_hash: BlockHash, location: impl Into<String>) -> Self {
        Self {
            hash,
            parent_hash,
            location: location.into(),
        }
    }
}

/// Parse an `additionalversions` metadata value. Empty input and `"[]"`
/// both yield an empty list.
pub fn parse_versions(value: &str) -> Result<Vec<BlockVersion>> {
    if value.is_empty() || value == "[]" {
        return Ok(Vec::new());
    }
    serde_json::from_str(value).map_err(|e| CodecError::MalformedVersionList(e.to_string()))
}

/// Serialize a sibling list back to its metadata form, preserving order.
pub fn serialize_versions(versions: &[BlockVersion]) -> String {
    if versions.is_empty() {
        return "[]".to_string();
    }
    // BlockVersion serialization cannot fail: all fields are strings.
    serde_json::to_string(versions).expect("version list serialization")
}

mod u64_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
