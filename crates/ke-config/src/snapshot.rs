//! Config snapshots for audit trails.
//!
//! The hash covers the canonical JSON serialization of the resolved config, so
//! two runs with identical effective settings share a hash regardless of file
//! format or field order on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::engine::EngineConfig;

/// Identity of the configuration an engine instance runs with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub schema_version: String,
    /// Where the config came from (`defaults`, or a file path).
    pub source: String,
    /// SHA-256 of the canonical JSON, hex-encoded.
    pub hash: String,
    pub captured_at: DateTime<Utc>,
}

impl ConfigSnapshot {
    pub fn capture(config: &EngineConfig, source: impl Into<String>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            schema_version: config.schema_version.clone(),
            source: source.into(),
            hash: config_hash(config)?,
            captured_at: Utc::now(),
        })
    }

    /// First 12 hex characters, for log lines.
    pub fn short_hash(&self) -> &str {
        &self.hash[..self.hash.len().min(12)]
    }
}

/// SHA-256 over the canonical JSON encoding of `config`.
pub fn config_hash(config: &EngineConfig) -> Result<String, serde_json::Error> {
    // Round-trip through Value so map keys serialize in sorted order.
    let value = serde_json::to_value(config)?;
    let canonical = serde_json::to_vec(&value)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}
