//! Pointer files for externally stored blobs.
//!
//! A pointer is the first half of the lazy-fetch protocol: it says where the
//! bytes live and what they must hash to. `fulfilled` flips to `true` only
//! once a verified copy exists at `localPath`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{BundleError, BundleResult};
use crate::model::{LayerEntry, Tier};
use crate::uri::ExternalUri;

pub const POINTER_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerFile {
    pub schema_version: u32,
    pub uri: String,
    pub content_hash: Digest,
    pub size_bytes: u64,
    pub tier: Option<Tier>,
    pub created_at: DateTime<Utc>,
    pub fulfilled: bool,
    pub local_path: Option<String>,
    pub original_path: String,
    pub layer: String,
}

impl PointerFile {
    /// Unfulfilled pointer for an external entry.
    pub fn for_entry(entry: &LayerEntry, layer: &str, created_at: DateTime<Utc>) -> BundleResult<Self> {
        let uri = entry.uri.clone().ok_or_else(|| {
            BundleError::validation(format!("entry '{}' is not external", entry.path))
        })?;
        Ok(Self {
            schema_version: POINTER_SCHEMA_VERSION,
            uri,
            content_hash: entry.content_hash.clone(),
            size_bytes: entry.size,
            tier: entry.tier,
            created_at,
            fulfilled: false,
            local_path: None,
            original_path: entry.path.clone(),
            layer: layer.to_string(),
        })
    }

    /// Mark as backed by a verified local copy at `local_path`.
    pub fn fulfilled_at(mut self, local_path: impl Into<String>) -> Self {
        self.fulfilled = true;
        self.local_path = Some(local_path.into());
        self
    }

    pub fn unfulfilled(mut self) -> Self {
        self.fulfilled = false;
        self.local_path = None;
        self
    }

    /// Pretty JSON with a trailing newline; field order is fixed by the struct.
    pub fn to_bytes(&self) -> BundleResult<Vec<u8>> {
        let mut out = serde_json::to_vec_pretty(self)
            .map_err(|e| BundleError::validation(format!("pointer serialization: {}", e)))?;
        out.push(b'\n');
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> BundleResult<Self> {
        let pointer: Self = serde_json::from_slice(bytes)
            .map_err(|e| BundleError::validation(format!("malformed pointer file: {}", e)))?;
        pointer.validate()?;
        Ok(pointer)
    }

    pub fn validate(&self) -> BundleResult<()> {
        if self.schema_version != POINTER_SCHEMA_VERSION {
            return Err(BundleError::validation(format!(
                "pointer for '{}' has schemaVersion {} (expected {})",
                self.original_path, self.schema_version, POINTER_SCHEMA_VERSION
            )));
        }
        ExternalUri::parse(&self.uri)?;
        if self.fulfilled && self.local_path.is_none() {
            return Err(BundleError::validation(format!(
                "pointer for '{}' is fulfilled but has no localPath",
                self.original_path
            )));
        }
        Ok(())
    }

    /// Equal in everything but `createdAt`.
    pub fn same_content(&self, other: &Self) -> bool {
        Self {
            created_at: other.created_at,
            ..self.clone()
        } == *other
    }
}
