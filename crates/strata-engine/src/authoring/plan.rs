//! Storage planning: assign scanned files to layers, decide inline versus
//! external storage, and build the layer indexes and bundle manifest.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use strata_core::{
    media, BundleError, BundleManifest, BundleMetadata, BundleResult, Digest, ExternalUri,
    LayerEntry, LayerIndex, ManifestLayer, ResolvedBundle, StorageKind,
};
use tracing::{debug, info};

use super::scan::{scan_dir, ScannedFile};
use super::spec::{BundleSpec, LayerMatcher, RuleMatcher};

/// One file with its storage decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedFile {
    pub layer: String,
    #[serde(skip)]
    pub source: PathBuf,
    pub entry: LayerEntry,
}

/// A layer with its index document.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerPlan {
    pub name: String,
    pub layer_id: Digest,
    pub index_digest: Digest,
    pub files: Vec<PlannedFile>,
    #[serde(skip)]
    pub index: LayerIndex,
    #[serde(skip)]
    pub index_bytes: Vec<u8>,
}

/// Everything needed to materialize or publish a working directory.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundlePlan {
    pub root: PathBuf,
    pub manifest_digest: Digest,
    pub layers: Vec<LayerPlan>,
    #[serde(skip)]
    pub spec: BundleSpec,
    #[serde(skip)]
    pub manifest: BundleManifest,
    #[serde(skip)]
    pub manifest_bytes: Vec<u8>,
}

/// Layer name to the files it claims, in spec order.
pub fn assign_layers(
    spec: &BundleSpec,
    files: Vec<ScannedFile>,
) -> BundleResult<Vec<(String, Vec<ScannedFile>)>> {
    let matchers: Vec<LayerMatcher> = spec.layer_matchers()?;
    let mut assigned: Vec<(String, Vec<ScannedFile>)> =
        matchers.iter().map(|m| (m.name.clone(), Vec::new())).collect();
    let mut ambiguous = Vec::new();

    for file in files {
        let hits: Vec<usize> = matchers
            .iter()
            .enumerate()
            .filter(|(_, m)| m.matches(&file.path))
            .map(|(i, _)| i)
            .collect();
        match hits.as_slice() {
            [] => debug!(path = %file.path, "not claimed by any layer"),
            [only] => assigned[*only].1.push(file),
            many => ambiguous.push(format!(
                "{} ({})",
                file.path,
                many.iter()
                    .map(|i| matchers[*i].name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }
    }

    if !ambiguous.is_empty() {
        return Err(BundleError::validation(format!(
            "files matched by more than one layer: {}",
            ambiguous.join("; ")
        )));
    }
    Ok(assigned)
}

/// Storage decision for one file: the first matching external rule wins.
pub fn decide(
    file: &ScannedFile,
    rules: &[RuleMatcher],
    inline_size_limit: u64,
) -> BundleResult<LayerEntry> {
    if let Some(rule) = rules.iter().find(|r| r.matches(&file.path, file.size)) {
        let uri = rule.rule.uri_for(&file.path);
        ExternalUri::parse(&uri)?;
        return Ok(LayerEntry::external(
            file.path.clone(),
            file.mode,
            file.size,
            file.content_hash.clone(),
            uri,
            Some(rule.rule.tier),
        ));
    }
    if file.size > inline_size_limit {
        return Err(BundleError::validation(format!(
            "{} is {} bytes, over the inline limit of {} bytes, and no external rule matches it",
            file.path, file.size, inline_size_limit
        )));
    }
    Ok(LayerEntry::inline(
        file.path.clone(),
        file.mode,
        file.size,
        file.content_hash.clone(),
    ))
}

impl BundlePlan {
    /// Load the spec in `root`, scan, and plan.
    pub fn build(root: &Path) -> BundleResult<Self> {
        let spec = BundleSpec::load(root)?;
        let files = scan_dir(root)?;
        Self::from_scan(root, spec, files)
    }

    pub fn from_scan(root: &Path, spec: BundleSpec, files: Vec<ScannedFile>) -> BundleResult<Self> {
        let rules = spec.rule_matchers()?;
        let limit = spec.spec.inline_size_limit;

        let mut layers = Vec::new();
        for (name, files) in assign_layers(&spec, files)? {
            let planned = files
                .into_iter()
                .map(|file| {
                    Ok(PlannedFile {
                        layer: name.clone(),
                        entry: decide(&file, &rules, limit)?,
                        source: file.source,
                    })
                })
                .collect::<BundleResult<Vec<_>>>()?;

            let index = LayerIndex::new(
                name.clone(),
                planned.iter().map(|f| f.entry.clone()).collect(),
            )?;
            let index_bytes = index.to_bytes()?;
            layers.push(LayerPlan {
                name,
                layer_id: index.layer_id()?,
                index_digest: Digest::of_bytes(&index_bytes),
                files: planned,
                index,
                index_bytes,
            });
        }

        let manifest = BundleManifest {
            media_type: media::BUNDLE_MANIFEST.to_string(),
            name: spec.metadata.name.clone(),
            version: spec.metadata.version.clone(),
            description: spec.metadata.description.clone(),
            annotations: BTreeMap::new(),
            roles: spec.spec.roles.clone(),
            layers: layers
                .iter()
                .map(|l| ManifestLayer {
                    name: l.name.clone(),
                    layer_id: l.layer_id.clone(),
                    index_digest: l.index_digest.clone(),
                })
                .collect(),
            external_index_present: layers.iter().any(|l| l.index.has_external()),
        };
        manifest.validate()?;
        let manifest_bytes = manifest.to_bytes()?;
        let manifest_digest = manifest.identity()?;

        info!(
            name = %manifest.name,
            version = %manifest.version,
            digest = %manifest_digest,
            layers = layers.len(),
            "bundle planned"
        );
        Ok(Self {
            root: root.to_path_buf(),
            manifest_digest,
            layers,
            spec,
            manifest,
            manifest_bytes,
        })
    }

    pub fn resolved(&self) -> BundleResult<ResolvedBundle> {
        ResolvedBundle::from_manifest(&self.manifest)
    }

    pub fn metadata(&self) -> BundleMetadata {
        BundleMetadata::from_manifest(&self.manifest)
    }

    pub fn layer(&self, name: &str) -> Option<&LayerPlan> {
        self.layers.iter().find(|l| l.name == name)
    }

    pub fn files(&self) -> impl Iterator<Item = &PlannedFile> {
        self.layers.iter().flat_map(|l| l.files.iter())
    }

    /// Source file backing a bundle path.
    pub fn source_of(&self, layer: &str, path: &str) -> Option<&Path> {
        self.layer(layer)?
            .files
            .iter()
            .find(|f| f.entry.path == path)
            .map(|f| f.source.as_path())
    }

    /// Counts per storage kind and tier, for reporting.
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for file in self.files() {
            match file.entry.kind {
                StorageKind::Inline => {
                    summary.inline_files += 1;
                    summary.inline_bytes += file.entry.size;
                }
                StorageKind::External => {
                    summary.external_files += 1;
                    summary.external_bytes += file.entry.size;
                    *summary
                        .external_by_tier
                        .entry(file.entry.tier.unwrap_or_default().to_string())
                        .or_default() += 1;
                }
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub inline_files: usize,
    pub inline_bytes: u64,
    pub external_files: usize,
    pub external_bytes: u64,
    pub external_by_tier: BTreeMap<String, usize>,
}
