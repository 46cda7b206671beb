//! Layer indexes, bundle manifests, and the identity model.
//!
//! Identity is content-only:
//!
//! - `layerId` = digest of the canonical entry array, sorted by path bytes
//! - `manifestDigest` = digest of `{externalIndexPresent, layers, roles}`
//!
//! Names, versions, descriptions, annotations and timestamps never reach a
//! digest, so retagging a bundle keeps its identity.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::canonical::CanonicalBytes;
use crate::digest::Digest;
use crate::error::{BundleError, BundleResult};
use crate::media;
use crate::path::safe_relpath;
use crate::reference::validate_role_name;
use crate::uri::ExternalUri;

/// Where an entry's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Blob stored in the registry next to the manifest.
    Inline,
    /// Blob stored in an object store and referenced by URI.
    External,
}

/// Access tier hint for external blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Hot,
    Cool,
    Archive,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hot => "hot",
            Self::Cool => "cool",
            Self::Archive => "archive",
        })
    }
}

/// Default mode for regular files.
pub const FILE_MODE: u32 = 0o644;

/// Mode for files with any execute bit.
pub const EXEC_MODE: u32 = 0o755;

/// Collapse host permissions to one of the two bundle modes.
pub fn normalize_mode(mode: u32) -> u32 {
    if mode & 0o111 != 0 {
        EXEC_MODE
    } else {
        FILE_MODE
    }
}

/// One file in a layer index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LayerEntry {
    pub path: String,
    pub mode: u32,
    pub size: u64,
    pub content_hash: Digest,
    #[serde(rename = "type")]
    pub kind: StorageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
}

impl LayerEntry {
    pub fn inline(path: impl Into<String>, mode: u32, size: u64, content_hash: Digest) -> Self {
        Self {
            path: path.into(),
            mode: normalize_mode(mode),
            size,
            content_hash,
            kind: StorageKind::Inline,
            uri: None,
            tier: None,
        }
    }

    pub fn external(
        path: impl Into<String>,
        mode: u32,
        size: u64,
        content_hash: Digest,
        uri: impl Into<String>,
        tier: Option<Tier>,
    ) -> Self {
        Self {
            path: path.into(),
            mode: normalize_mode(mode),
            size,
            content_hash,
            kind: StorageKind::External,
            uri: Some(uri.into()),
            tier,
        }
    }

    /// Check path form, mode, and storage-kind consistency.
    pub fn validate(&self) -> BundleResult<()> {
        let normalized = safe_relpath(&self.path)?;
        if normalized != self.path {
            return Err(BundleError::validation(format!(
                "entry path '{}' is not normalized (expected '{}')",
                self.path, normalized
            )));
        }
        if self.mode != FILE_MODE && self.mode != EXEC_MODE {
            return Err(BundleError::validation(format!(
                "entry '{}' has mode {:o}; only 644 and 755 are allowed",
                self.path, self.mode
            )));
        }
        match self.kind {
            StorageKind::Inline => {
                if self.uri.is_some() || self.tier.is_some() {
                    return Err(BundleError::validation(format!(
                        "inline entry '{}' must not carry uri or tier",
                        self.path
                    )));
                }
            }
            StorageKind::External => {
                let uri = self.uri.as_deref().ok_or_else(|| {
                    BundleError::validation(format!("external entry '{}' has no uri", self.path))
                })?;
                ExternalUri::parse(uri)?;
            }
        }
        Ok(())
    }

    pub fn is_external(&self) -> bool {
        self.kind == StorageKind::External
    }
}

/// Sort entries by path bytes and reject duplicates.
fn sorted_entries(mut entries: Vec<LayerEntry>) -> BundleResult<Vec<LayerEntry>> {
    entries.sort_by(|a, b| a.path.as_bytes().cmp(b.path.as_bytes()));
    for pair in entries.windows(2) {
        if pair[0].path == pair[1].path {
            return Err(BundleError::validation(format!(
                "duplicate entry path '{}' in layer",
                pair[0].path
            )));
        }
    }
    Ok(entries)
}

/// Compute a layer id from entries in any order.
pub fn layer_id(entries: &[LayerEntry]) -> BundleResult<Digest> {
    let sorted = sorted_entries(entries.to_vec())?;
    Ok(Digest::of_canonical(&CanonicalBytes::new(&sorted)?))
}

/// Per-layer index document stored as a registry blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerIndex {
    pub media_type: String,
    pub layer: String,
    pub entries: Vec<LayerEntry>,
}

impl LayerIndex {
    /// Build an index; entries are validated and sorted.
    pub fn new(layer: impl Into<String>, entries: Vec<LayerEntry>) -> BundleResult<Self> {
        let layer = layer.into();
        validate_role_name(&layer).map_err(|reason| {
            BundleError::validation(format!("invalid layer name '{}': {}", layer, reason))
        })?;
        for entry in &entries {
            entry.validate()?;
        }
        Ok(Self {
            media_type: media::LAYER_INDEX.to_string(),
            layer,
            entries: sorted_entries(entries)?,
        })
    }

    pub fn layer_id(&self) -> BundleResult<Digest> {
        layer_id(&self.entries)
    }

    /// Canonical document bytes; their digest is the index blob digest.
    pub fn to_bytes(&self) -> BundleResult<Vec<u8>> {
        Ok(CanonicalBytes::new(self)?.into_vec())
    }

    /// Parse and validate a fetched index blob.
    pub fn from_bytes(bytes: &[u8]) -> BundleResult<Self> {
        let raw: Self = serde_json::from_slice(bytes)
            .map_err(|e| BundleError::validation(format!("malformed layer index: {}", e)))?;
        if raw.media_type != media::LAYER_INDEX {
            return Err(BundleError::UnsupportedMediaType {
                media_type: raw.media_type,
                subject: format!("layer index '{}'", raw.layer),
            });
        }
        Self::new(raw.layer, raw.entries)
    }

    pub fn has_external(&self) -> bool {
        self.entries.iter().any(LayerEntry::is_external)
    }
}

/// A layer as listed in the bundle manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestLayer {
    pub name: String,
    pub layer_id: Digest,
    /// Digest of the layer index blob in the registry.
    pub index_digest: Digest,
}

/// The bundle manifest document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    pub media_type: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    pub roles: BTreeMap<String, Vec<String>>,
    pub layers: Vec<ManifestLayer>,
    pub external_index_present: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentityLayer<'a> {
    name: &'a str,
    layer_id: &'a Digest,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentityPayload<'a> {
    layers: Vec<IdentityLayer<'a>>,
    roles: BTreeMap<&'a str, Vec<&'a str>>,
    external_index_present: bool,
}

/// Manifest identity from its content-defining parts. Layers are hashed
/// sorted by name, so declaration order does not matter.
pub fn manifest_identity<'a>(
    layers: impl IntoIterator<Item = (&'a str, &'a Digest)>,
    roles: &'a BTreeMap<String, Vec<String>>,
    external_index_present: bool,
) -> BundleResult<Digest> {
    let mut layers: Vec<IdentityLayer<'a>> = layers
        .into_iter()
        .map(|(name, layer_id)| IdentityLayer { name, layer_id })
        .collect();
    layers.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
    let payload = IdentityPayload {
        layers,
        roles: roles
            .iter()
            .map(|(role, names)| {
                let set: BTreeSet<&str> = names.iter().map(String::as_str).collect();
                (role.as_str(), set.into_iter().collect())
            })
            .collect(),
        external_index_present,
    };
    Ok(Digest::of_canonical(&CanonicalBytes::new(&payload)?))
}

impl BundleManifest {
    /// Content identity of this manifest.
    pub fn identity(&self) -> BundleResult<Digest> {
        manifest_identity(
            self.layers
                .iter()
                .map(|l| (l.name.as_str(), &l.layer_id)),
            &self.roles,
            self.external_index_present,
        )
    }

    /// Every role must reference declared layers; layer names must be unique.
    pub fn validate(&self) -> BundleResult<()> {
        let mut names = BTreeSet::new();
        for layer in &self.layers {
            validate_role_name(&layer.name).map_err(|reason| {
                BundleError::validation(format!("invalid layer name '{}': {}", layer.name, reason))
            })?;
            if !names.insert(layer.name.as_str()) {
                return Err(BundleError::validation(format!(
                    "layer '{}' declared more than once",
                    layer.name
                )));
            }
        }
        validate_roles(&self.roles, &names)
    }

    pub fn to_bytes(&self) -> BundleResult<Vec<u8>> {
        Ok(CanonicalBytes::new(self)?.into_vec())
    }

    pub fn from_bytes(bytes: &[u8]) -> BundleResult<Self> {
        let manifest: Self = serde_json::from_slice(bytes)
            .map_err(|e| BundleError::validation(format!("malformed bundle manifest: {}", e)))?;
        if manifest.media_type != media::BUNDLE_MANIFEST {
            return Err(BundleError::UnsupportedMediaType {
                media_type: manifest.media_type,
                subject: format!("bundle manifest '{}'", manifest.name),
            });
        }
        manifest.validate()?;
        Ok(manifest)
    }
}

/// Check that every role names only known layers.
///
/// The error lists every offending `role -> layer` pair, not just the first.
pub fn validate_roles(
    roles: &BTreeMap<String, Vec<String>>,
    layers: &BTreeSet<&str>,
) -> BundleResult<()> {
    let mut offenders = Vec::new();
    for (role, role_layers) in roles {
        validate_role_name(role).map_err(|reason| {
            BundleError::validation(format!("invalid role name '{}': {}", role, reason))
        })?;
        for layer in role_layers {
            if !layers.contains(layer.as_str()) {
                offenders.push(format!("{} -> {}", role, layer));
            }
        }
    }
    if offenders.is_empty() {
        Ok(())
    } else {
        Err(BundleError::validation(format!(
            "roles reference unknown layers: {}",
            offenders.join(", ")
        )))
    }
}

/// A layer of a resolved bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDescriptor {
    pub name: String,
    pub layer_id: Digest,
}

/// Immutable result of resolving a reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedBundle {
    pub manifest_digest: Digest,
    pub media_type: String,
    pub roles: BTreeMap<String, Vec<String>>,
    pub layers: Vec<LayerDescriptor>,
    pub layer_index_digests: BTreeMap<String, Digest>,
    pub external_index_present: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

impl ResolvedBundle {
    /// Project a validated manifest onto its resolved form.
    pub fn from_manifest(manifest: &BundleManifest) -> BundleResult<Self> {
        manifest.validate()?;
        Ok(Self {
            manifest_digest: manifest.identity()?,
            media_type: manifest.media_type.clone(),
            roles: manifest.roles.clone(),
            layers: manifest
                .layers
                .iter()
                .map(|l| LayerDescriptor {
                    name: l.name.clone(),
                    layer_id: l.layer_id.clone(),
                })
                .collect(),
            layer_index_digests: manifest
                .layers
                .iter()
                .map(|l| (l.name.clone(), l.index_digest.clone()))
                .collect(),
            external_index_present: manifest.external_index_present,
            cache_dir: None,
        })
    }

    /// Layer ids in manifest order.
    pub fn layer_ids(&self) -> Vec<&Digest> {
        self.layers.iter().map(|l| &l.layer_id).collect()
    }

    pub fn layer(&self, name: &str) -> Option<&LayerDescriptor> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Role names in sorted order.
    pub fn role_names(&self) -> Vec<String> {
        self.roles.keys().cloned().collect()
    }

    /// Recompute the identity from the resolved fields.
    pub fn recompute_identity(&self) -> BundleResult<Digest> {
        manifest_identity(
            self.layers
                .iter()
                .map(|l| (l.name.as_str(), &l.layer_id)),
            &self.roles,
            self.external_index_present,
        )
    }
}

/// Human metadata that travels next to a resolved bundle but is not identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Registry digest of the outer envelope, when resolved from a registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_digest: Option<Digest>,
}

impl BundleMetadata {
    pub fn from_manifest(manifest: &BundleManifest) -> Self {
        Self {
            name: Some(manifest.name.clone()),
            version: Some(manifest.version.clone()),
            description: manifest.description.clone(),
            registry_digest: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn h(s: &str) -> Digest {
        Digest::of_bytes(s.as_bytes())
    }

    fn entries() -> Vec<LayerEntry> {
        vec![
            LayerEntry::inline("src/model.py", 0o644, 12, h("model")),
            LayerEntry::inline("src/__init__.py", 0o644, 0, h("")),
            LayerEntry::inline("bin/run.sh", 0o775, 30, h("run")),
            LayerEntry::external(
                "data/train.csv",
                0o644,
                1024,
                h("train"),
                "s3://bucket/data/train.csv",
                Some(Tier::Cool),
            ),
        ]
    }

    fn manifest(layer_ids: &[(&str, Digest)], version: &str) -> BundleManifest {
        let mut roles = BTreeMap::new();
        roles.insert(
            "runtime".to_string(),
            vec!["code".to_string(), "config".to_string()],
        );
        roles.insert(
            "training".to_string(),
            vec!["code".to_string(), "config".to_string(), "data".to_string()],
        );
        BundleManifest {
            media_type: media::BUNDLE_MANIFEST.to_string(),
            name: "team/model".to_string(),
            version: version.to_string(),
            description: None,
            annotations: BTreeMap::new(),
            roles,
            layers: layer_ids
                .iter()
                .map(|(name, id)| ManifestLayer {
                    name: name.to_string(),
                    layer_id: id.clone(),
                    index_digest: h(name),
                })
                .collect(),
            external_index_present: true,
        }
    }

    #[test]
    fn test_layer_id_ignores_entry_order() {
        let base = layer_id(&entries()).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let mut shuffled = entries();
            shuffled.shuffle(&mut rng);
            assert_eq!(layer_id(&shuffled).unwrap(), base);
        }
    }

    #[test]
    fn test_layer_id_changes_with_content() {
        let base = layer_id(&entries()).unwrap();
        let mut changed = entries();
        changed[0].content_hash = h("model!");
        assert_ne!(layer_id(&changed).unwrap(), base);
    }

    #[test]
    fn test_layer_index_roundtrip_through_json_with_shuffled_keys() {
        let index = LayerIndex::new("code", entries()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&index.to_bytes().unwrap()).unwrap();
        // Re-serialize with pretty printing; the parsed index must hash the same.
        let pretty = serde_json::to_vec_pretty(&value).unwrap();
        let reparsed = LayerIndex::from_bytes(&pretty).unwrap();
        assert_eq!(reparsed.layer_id().unwrap(), index.layer_id().unwrap());
    }

    #[test]
    fn test_duplicate_paths_rejected() {
        let mut e = entries();
        e.push(LayerEntry::inline("src/model.py", 0o644, 1, h("dup")));
        assert!(LayerIndex::new("code", e).is_err());
    }

    #[test]
    fn test_entry_validation() {
        let bad = LayerEntry::inline("../escape", 0o644, 1, h("x"));
        assert!(bad.validate().is_err());
        let mut ext = LayerEntry::external("d.bin", 0o644, 1, h("x"), "ftp://x/y", None);
        assert!(ext.validate().is_err());
        ext.uri = Some("s3://bucket/d.bin".into());
        assert!(ext.validate().is_ok());
    }

    #[test]
    fn test_unknown_media_type() {
        let mut index = LayerIndex::new("code", entries()).unwrap();
        index.media_type = "application/x-unknown".into();
        let bytes = serde_json::to_vec(&index).unwrap();
        let err = LayerIndex::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, BundleError::UnsupportedMediaType { .. }));
    }

    #[test]
    fn test_manifest_identity_ignores_version_and_annotations() {
        let ids = [("code", h("c")), ("config", h("f")), ("data", h("d"))];
        let a = manifest(&ids, "1.0.0");
        let mut b = manifest(&ids, "2.0.0-retag");
        b.description = Some("retagged".into());
        b.annotations.insert("ci.build".into(), "42".into());
        assert_eq!(a.identity().unwrap(), b.identity().unwrap());
    }

    #[test]
    fn test_manifest_identity_ignores_role_list_order() {
        let ids = [("code", h("c")), ("config", h("f")), ("data", h("d"))];
        let a = manifest(&ids, "1.0.0");
        let mut b = a.clone();
        b.roles
            .insert("training".into(), vec!["data".into(), "code".into(), "config".into()]);
        assert_eq!(a.identity().unwrap(), b.identity().unwrap());
    }

    #[test]
    fn test_manifest_identity_ignores_layer_order() {
        let ids = [("code", h("c")), ("config", h("f")), ("data", h("d"))];
        let a = manifest(&ids, "1.0.0");
        let mut b = a.clone();
        b.layers.reverse();
        assert_eq!(a.identity().unwrap(), b.identity().unwrap());

        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        let mut c = a.clone();
        c.layers.shuffle(&mut rng);
        assert_eq!(a.identity().unwrap(), c.identity().unwrap());

        let forward = manifest_identity([("code", &ids[0].1), ("data", &ids[2].1)], &a.roles, true);
        let backward = manifest_identity([("data", &ids[2].1), ("code", &ids[0].1)], &a.roles, true);
        assert_eq!(forward.unwrap(), backward.unwrap());
    }

    #[test]
    fn test_manifest_identity_tracks_layer_content() {
        let ids = [("code", h("c")), ("config", h("f")), ("data", h("d"))];
        let changed = [("code", h("c2")), ("config", h("f")), ("data", h("d"))];
        assert_ne!(
            manifest(&ids, "1").identity().unwrap(),
            manifest(&changed, "1").identity().unwrap()
        );
    }

    #[test]
    fn test_role_validation_lists_every_offender() {
        let ids = [("code", h("c"))];
        let m = manifest(&ids, "1");
        let err = m.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("runtime -> config"));
        assert!(msg.contains("training -> data"));
    }

    #[test]
    fn test_resolved_from_manifest() {
        let ids = [("code", h("c")), ("config", h("f")), ("data", h("d"))];
        let m = manifest(&ids, "1");
        let resolved = ResolvedBundle::from_manifest(&m).unwrap();
        assert_eq!(resolved.manifest_digest, m.identity().unwrap());
        assert_eq!(resolved.recompute_identity().unwrap(), resolved.manifest_digest);
        assert_eq!(resolved.layer_ids().len(), 3);
        assert_eq!(resolved.layer_index_digests["data"], h("data"));
    }
}
