//! Content-addressable registry collaborator.
//!
//! A [`BundleRegistry`] is bound to exactly one repository. References passed
//! to manifest operations are either a tag or a `sha256:` digest.

use async_trait::async_trait;
use bytes::Bytes;
use strata_core::Digest;

use crate::error::StorageResult;
use crate::types::{ManifestHead, ManifestResponse};

pub mod memory;
pub mod oci;

pub use memory::InMemoryRegistry;
pub use oci::OciRegistryClient;

#[async_trait]
pub trait BundleRegistry: Send + Sync {
    async fn blob_exists(&self, digest: &Digest) -> StorageResult<bool>;

    /// Fetch a blob; implementations verify the bytes hash to `digest`.
    async fn get_blob(&self, digest: &Digest) -> StorageResult<Bytes>;

    /// Upload a blob addressed by `digest`.
    async fn put_blob(&self, digest: &Digest, bytes: Bytes) -> StorageResult<()>;

    async fn get_manifest(&self, reference: &str) -> StorageResult<ManifestResponse>;

    /// Store a manifest, optionally under `tag`; returns its registry digest.
    async fn put_manifest(
        &self,
        media_type: &str,
        bytes: Bytes,
        tag: Option<&str>,
    ) -> StorageResult<Digest>;

    /// `Ok(None)` when the reference does not exist.
    async fn head_manifest(&self, reference: &str) -> StorageResult<Option<ManifestHead>>;

    /// Human-readable location for logs and messages.
    fn location(&self) -> String;
}

/// Check that `bytes` hash to `expected`.
pub(crate) fn verify_blob(subject: &str, expected: &Digest, bytes: &[u8]) -> StorageResult<()> {
    let actual = Digest::of_bytes(bytes);
    if &actual != expected {
        return Err(crate::error::StorageError::DigestMismatch {
            subject: subject.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}
