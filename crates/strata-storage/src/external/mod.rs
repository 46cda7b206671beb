//! Object-store collaborator for externally stored blobs.
//!
//! Every data object `<key>` gets a sidecar `<key>.sha256` holding an
//! [`ExternalRecord`], so `stat` can report the content hash without
//! downloading the object.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strata_core::{media, Digest, ExternalUri, Tier};

use crate::error::StorageResult;
use crate::types::ExternalStat;

pub mod object_store_backend;

pub use object_store_backend::ObjectStoreExternal;

/// Suffix of the hash sidecar object.
pub const SIDECAR_SUFFIX: &str = ".sha256";

#[async_trait]
pub trait ExternalStore: Send + Sync {
    /// Size, hash and tier without downloading; `Ok(None)` when absent.
    async fn stat(&self, uri: &ExternalUri) -> StorageResult<Option<ExternalStat>>;

    async fn get(&self, uri: &ExternalUri) -> StorageResult<Bytes>;

    /// Upload; a mismatch against `expected_hash` fails before anything is written.
    async fn put(
        &self,
        uri: &ExternalUri,
        bytes: Bytes,
        expected_hash: Option<&Digest>,
        tier: Option<Tier>,
    ) -> StorageResult<ExternalStat>;
}

/// Sidecar document stored next to each external object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRecord {
    pub media_type: String,
    pub uri: String,
    pub size_bytes: u64,
    pub content_hash: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
}

impl ExternalRecord {
    pub fn new(uri: &ExternalUri, size_bytes: u64, content_hash: Digest, tier: Option<Tier>) -> Self {
        Self {
            media_type: media::EXTERNAL_REF.to_string(),
            uri: uri.to_string(),
            size_bytes,
            content_hash,
            tier,
        }
    }

    pub fn to_stat(&self) -> ExternalStat {
        ExternalStat {
            uri: self.uri.clone(),
            size_bytes: self.size_bytes,
            content_hash: Some(self.content_hash.clone()),
            tier: self.tier,
        }
    }
}
