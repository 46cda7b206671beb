//! In-process registry used by tests and local round trips.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use strata_core::Digest;

use super::{verify_blob, BundleRegistry};
use crate::error::{StorageError, StorageResult};
use crate::types::{ManifestHead, ManifestResponse};

#[derive(Debug, Default)]
struct State {
    blobs: HashMap<Digest, Bytes>,
    manifests: HashMap<Digest, (String, Bytes)>,
    tags: HashMap<String, Digest>,
}

/// Registry kept in memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistry {
    repository: String,
    state: Arc<RwLock<State>>,
}

impl InMemoryRegistry {
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            state: Arc::default(),
        }
    }

    /// Number of stored blobs.
    pub fn blob_count(&self) -> usize {
        self.read().blobs.len()
    }

    /// Tags currently pointing at `digest`, sorted.
    pub fn tags_for(&self, digest: &Digest) -> Vec<String> {
        let state = self.read();
        let mut tags: Vec<String> = state
            .tags
            .iter()
            .filter(|(_, d)| *d == digest)
            .map(|(t, _)| t.clone())
            .collect();
        tags.sort();
        tags
    }

    /// Replace a stored blob without digest checks (for tamper tests).
    pub fn corrupt_blob(&self, digest: &Digest, bytes: Bytes) {
        self.write().blobs.insert(digest.clone(), bytes);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        // A poisoned lock only means another test thread panicked; the map is still usable.
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, reference: &str) -> Option<(Digest, String, Bytes)> {
        let state = self.read();
        let digest = match Digest::parse(reference) {
            Ok(d) => d,
            Err(_) => state.tags.get(reference)?.clone(),
        };
        let (media_type, bytes) = state.manifests.get(&digest)?.clone();
        Some((digest, media_type, bytes))
    }
}

#[async_trait]
impl BundleRegistry for InMemoryRegistry {
    async fn blob_exists(&self, digest: &Digest) -> StorageResult<bool> {
        Ok(self.read().blobs.contains_key(digest))
    }

    async fn get_blob(&self, digest: &Digest) -> StorageResult<Bytes> {
        let bytes = self
            .read()
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("blob {}", digest)))?;
        verify_blob(&format!("blob {}", digest), digest, &bytes)?;
        Ok(bytes)
    }

    async fn put_blob(&self, digest: &Digest, bytes: Bytes) -> StorageResult<()> {
        verify_blob(&format!("upload of blob {}", digest), digest, &bytes)?;
        self.write().blobs.insert(digest.clone(), bytes);
        Ok(())
    }

    async fn get_manifest(&self, reference: &str) -> StorageResult<ManifestResponse> {
        let (digest, media_type, bytes) = self.lookup(reference).ok_or_else(|| {
            StorageError::not_found(format!("manifest {}@{}", self.repository, reference))
        })?;
        Ok(ManifestResponse {
            media_type,
            digest,
            bytes,
        })
    }

    async fn put_manifest(
        &self,
        media_type: &str,
        bytes: Bytes,
        tag: Option<&str>,
    ) -> StorageResult<Digest> {
        let digest = Digest::of_bytes(&bytes);
        let mut state = self.write();
        state
            .manifests
            .insert(digest.clone(), (media_type.to_string(), bytes));
        if let Some(tag) = tag {
            state.tags.insert(tag.to_string(), digest.clone());
        }
        Ok(digest)
    }

    async fn head_manifest(&self, reference: &str) -> StorageResult<Option<ManifestHead>> {
        Ok(self
            .lookup(reference)
            .map(|(digest, media_type, bytes)| ManifestHead {
                digest,
                media_type,
                size: bytes.len() as u64,
            }))
    }

    fn location(&self) -> String {
        format!("memory://{}", self.repository)
    }
}
