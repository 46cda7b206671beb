//! Publishing a planned bundle to a registry and external stores.
//!
//! Upload order makes a half-finished push harmless: content blobs first,
//! then index and manifest blobs, and the tagged envelope last.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use strata_core::reference::{digest_alias_tag, version_tag};
use strata_core::{
    media, BundleError, BundleResult, Digest, ExternalUri, OciDescriptor, OciManifest, StorageKind,
};
use strata_storage::{BundleRegistry, ExternalStore};
use tracing::{debug, info};

use super::plan::{BundlePlan, PlannedFile};

/// Annotation keys set on the envelope.
pub const NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";
pub const VERSION_ANNOTATION: &str = "org.opencontainers.image.version";
pub const DESCRIPTION_ANNOTATION: &str = "org.opencontainers.image.description";

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Report what would be uploaded without touching any store.
    pub dry_run: bool,
    /// Extra envelope annotations; never part of the identity.
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReport {
    /// Bundle identity.
    pub manifest_digest: Digest,
    /// Digest of the uploaded envelope; `None` on dry run.
    pub registry_digest: Option<Digest>,
    pub tags: Vec<String>,
    pub blobs_uploaded: usize,
    pub blobs_skipped: usize,
    pub external_uploaded: usize,
    pub external_skipped: usize,
    pub dry_run: bool,
}

pub struct Publisher {
    registry: Arc<dyn BundleRegistry>,
    external: Arc<dyn ExternalStore>,
}

impl Publisher {
    pub fn new(registry: Arc<dyn BundleRegistry>, external: Arc<dyn ExternalStore>) -> Self {
        Self { registry, external }
    }

    /// Envelope annotations: spec metadata, spec annotations, then `options`.
    fn annotations(plan: &BundlePlan, options: &PublishOptions) -> BTreeMap<String, String> {
        let meta = &plan.spec.metadata;
        let mut out = BTreeMap::new();
        out.insert(NAME_ANNOTATION.to_string(), meta.name.clone());
        out.insert(VERSION_ANNOTATION.to_string(), meta.version.clone());
        if let Some(description) = &meta.description {
            out.insert(DESCRIPTION_ANNOTATION.to_string(), description.clone());
        }
        out.extend(meta.annotations.clone());
        out.extend(options.annotations.clone());
        out
    }

    /// Envelope bytes for `plan`. Deterministic for a given plan and options.
    pub fn envelope(plan: &BundlePlan, options: &PublishOptions) -> BundleResult<Vec<u8>> {
        let manifest_desc = OciDescriptor::new(media::BUNDLE_MANIFEST, &plan.manifest_bytes)
            .titled(media::BUNDLE_MANIFEST_TITLE);
        let index_descs = plan
            .layers
            .iter()
            .map(|l| OciDescriptor::new(media::LAYER_INDEX, &l.index_bytes).titled(l.name.clone()))
            .collect();
        OciManifest::for_bundle(manifest_desc, index_descs, Self::annotations(plan, options))
            .to_bytes()
    }

    pub async fn publish(
        &self,
        plan: &BundlePlan,
        options: &PublishOptions,
    ) -> BundleResult<PublishReport> {
        let tags = vec![
            version_tag(&plan.manifest.name, &plan.manifest.version),
            digest_alias_tag(&plan.manifest_digest),
        ];
        let mut report = PublishReport {
            manifest_digest: plan.manifest_digest.clone(),
            registry_digest: None,
            tags: tags.clone(),
            blobs_uploaded: 0,
            blobs_skipped: 0,
            external_uploaded: 0,
            external_skipped: 0,
            dry_run: options.dry_run,
        };
        let envelope = Self::envelope(plan, options)?;

        if options.dry_run {
            let summary = plan.summary();
            report.blobs_uploaded = summary.inline_files + plan.layers.len() + 2;
            report.external_uploaded = summary.external_files;
            info!(digest = %plan.manifest_digest, "dry run, nothing uploaded");
            return Ok(report);
        }

        for file in plan.files() {
            let bytes = read_verified(file).await?;
            match file.entry.kind {
                StorageKind::Inline => {
                    if self.put_blob_once(&file.entry.content_hash, bytes).await? {
                        report.blobs_uploaded += 1;
                    } else {
                        report.blobs_skipped += 1;
                    }
                }
                StorageKind::External => {
                    if self.put_external_once(file, bytes).await? {
                        report.external_uploaded += 1;
                    } else {
                        report.external_skipped += 1;
                    }
                }
            }
        }

        let mut documents: Vec<&[u8]> = plan.layers.iter().map(|l| l.index_bytes.as_slice()).collect();
        documents.push(&plan.manifest_bytes);
        documents.push(media::OCI_EMPTY_CONFIG_BYTES);
        for bytes in documents {
            let digest = Digest::of_bytes(bytes);
            if self.put_blob_once(&digest, Bytes::copy_from_slice(bytes)).await? {
                report.blobs_uploaded += 1;
            } else {
                report.blobs_skipped += 1;
            }
        }

        let envelope = Bytes::from(envelope);
        let mut registry_digest = None;
        for tag in &tags {
            let digest = self
                .registry
                .put_manifest(media::OCI_IMAGE_MANIFEST, envelope.clone(), Some(tag))
                .await?;
            debug!(tag = %tag, digest = %digest, "manifest tagged");
            registry_digest = Some(digest);
        }
        report.registry_digest = registry_digest;

        info!(
            name = %plan.manifest.name,
            version = %plan.manifest.version,
            digest = %plan.manifest_digest,
            registry = %self.registry.location(),
            uploaded = report.blobs_uploaded,
            skipped = report.blobs_skipped,
            "bundle published"
        );
        Ok(report)
    }

    /// Upload unless present; `true` when bytes were sent.
    async fn put_blob_once(&self, digest: &Digest, bytes: Bytes) -> BundleResult<bool> {
        if self.registry.blob_exists(digest).await? {
            debug!(digest = %digest, "blob already present");
            return Ok(false);
        }
        self.registry.put_blob(digest, bytes).await?;
        Ok(true)
    }

    async fn put_external_once(&self, file: &PlannedFile, bytes: Bytes) -> BundleResult<bool> {
        let raw = file.entry.uri.as_deref().ok_or_else(|| {
            BundleError::validation(format!("entry '{}' has no external uri", file.entry.path))
        })?;
        let uri = ExternalUri::parse(raw)?;

        if let Some(stat) = self.external.stat(&uri).await? {
            if stat.size_bytes == file.entry.size
                && stat.content_hash.as_ref() == Some(&file.entry.content_hash)
            {
                debug!(uri = %uri, "external object already present");
                return Ok(false);
            }
        }
        self.external
            .put(&uri, bytes, Some(&file.entry.content_hash), file.entry.tier)
            .await?;
        Ok(true)
    }
}

/// Read a planned source file and check it still matches the plan.
async fn read_verified(file: &PlannedFile) -> BundleResult<Bytes> {
    let bytes = tokio::fs::read(&file.source)
        .await
        .map_err(|e| BundleError::io(&file.source, e))?;
    let actual = Digest::of_bytes(&bytes);
    if actual != file.entry.content_hash {
        return Err(BundleError::DigestMismatch {
            subject: format!("{} changed since it was planned", file.entry.path),
            expected: file.entry.content_hash.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(Bytes::from(bytes))
}
