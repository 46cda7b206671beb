//! OCI image manifest envelope carrying a bundle.
//!
//! Layer order in the envelope: bundle manifest blob first, then one layer
//! index blob per bundle layer, each titled by annotation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{BundleError, BundleResult};
use crate::media;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciDescriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl OciDescriptor {
    pub fn new(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            digest: Digest::of_bytes(bytes),
            size: bytes.len() as u64,
            annotations: BTreeMap::new(),
        }
    }

    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.annotations
            .insert(media::TITLE_ANNOTATION.to_string(), title.into());
        self
    }

    pub fn title(&self) -> Option<&str> {
        self.annotations
            .get(media::TITLE_ANNOTATION)
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifest {
    pub schema_version: u32,
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    pub config: OciDescriptor,
    pub layers: Vec<OciDescriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl OciManifest {
    /// Envelope for a bundle manifest blob and its layer index blobs.
    pub fn for_bundle(
        bundle_manifest: OciDescriptor,
        layer_indexes: Vec<OciDescriptor>,
        annotations: BTreeMap<String, String>,
    ) -> Self {
        let mut layers = Vec::with_capacity(layer_indexes.len() + 1);
        layers.push(bundle_manifest);
        layers.extend(layer_indexes);
        Self {
            schema_version: 2,
            media_type: media::OCI_IMAGE_MANIFEST.to_string(),
            artifact_type: Some(media::BUNDLE_ARTIFACT.to_string()),
            config: OciDescriptor::new(media::OCI_EMPTY_CONFIG, media::OCI_EMPTY_CONFIG_BYTES),
            layers,
            annotations,
        }
    }

    pub fn to_bytes(&self) -> BundleResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| BundleError::validation(format!("envelope serialization: {}", e)))
    }

    /// Parse an envelope and check its media type.
    pub fn from_bytes(bytes: &[u8], declared_media_type: Option<&str>) -> BundleResult<Self> {
        if let Some(declared) = declared_media_type {
            if declared != media::OCI_IMAGE_MANIFEST {
                return Err(BundleError::UnsupportedMediaType {
                    media_type: declared.to_string(),
                    subject: "registry manifest".to_string(),
                });
            }
        }
        let manifest: Self = serde_json::from_slice(bytes)
            .map_err(|e| BundleError::validation(format!("malformed OCI manifest: {}", e)))?;
        if manifest.media_type != media::OCI_IMAGE_MANIFEST {
            return Err(BundleError::UnsupportedMediaType {
                media_type: manifest.media_type,
                subject: "registry manifest".to_string(),
            });
        }
        if manifest.schema_version != 2 {
            return Err(BundleError::validation(format!(
                "OCI manifest schemaVersion {} (expected 2)",
                manifest.schema_version
            )));
        }
        Ok(manifest)
    }

    /// The descriptor of the bundle manifest blob.
    pub fn bundle_manifest(&self) -> BundleResult<&OciDescriptor> {
        let mut found = self
            .layers
            .iter()
            .filter(|l| l.media_type == media::BUNDLE_MANIFEST);
        let first = found.next().ok_or_else(|| {
            let seen: Vec<&str> = self.layers.iter().map(|l| l.media_type.as_str()).collect();
            BundleError::UnsupportedMediaType {
                media_type: if seen.is_empty() {
                    "<no layers>".to_string()
                } else {
                    seen.join(", ")
                },
                subject: "registry manifest without a bundle manifest layer".to_string(),
            }
        })?;
        if found.next().is_some() {
            return Err(BundleError::validation(
                "registry manifest carries more than one bundle manifest layer",
            ));
        }
        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_digest_constant() {
        let config = OciDescriptor::new(media::OCI_EMPTY_CONFIG, media::OCI_EMPTY_CONFIG_BYTES);
        assert_eq!(config.digest.as_str(), media::OCI_EMPTY_CONFIG_DIGEST);
        assert_eq!(config.size, 2);
    }

    #[test]
    fn test_bundle_manifest_located() {
        let bm = OciDescriptor::new(media::BUNDLE_MANIFEST, b"{}").titled(media::BUNDLE_MANIFEST_TITLE);
        let idx = OciDescriptor::new(media::LAYER_INDEX, b"[]").titled("code");
        let env = OciManifest::for_bundle(bm.clone(), vec![idx], BTreeMap::new());
        let parsed = OciManifest::from_bytes(&env.to_bytes().unwrap(), Some(media::OCI_IMAGE_MANIFEST)).unwrap();
        assert_eq!(parsed.bundle_manifest().unwrap(), &bm);
        assert_eq!(parsed.layers[1].title(), Some("code"));
    }

    #[test]
    fn test_foreign_manifest_rejected() {
        let err = OciManifest::from_bytes(b"{}", Some("application/vnd.docker.distribution.manifest.v2+json"))
            .unwrap_err();
        assert!(matches!(err, BundleError::UnsupportedMediaType { .. }));

        let image = OciManifest {
            layers: vec![OciDescriptor::new("application/vnd.oci.image.layer.v1.tar+gzip", b"x")],
            ..OciManifest::for_bundle(OciDescriptor::new(media::BUNDLE_MANIFEST, b"{}"), vec![], BTreeMap::new())
        };
        let err = image.bundle_manifest().unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }
}
