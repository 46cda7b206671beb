//! Content providers feed the materializer.
//!
//! A provider lists the entries of selected layers and hands over their
//! bytes. The materializer verifies every byte it receives, so providers
//! may return unverified data.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use strata_core::{
    media, BundleError, BundleManifest, BundleResult, Digest, ExternalUri, LayerEntry, LayerIndex,
    ManifestLayer, ResolvedBundle,
};
use strata_storage::{BundleRegistry, ExternalStore};
use tracing::debug;

use crate::authoring::BundlePlan;

/// A layer entry together with the layer that provides it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatEntry {
    pub layer: String,
    pub layer_id: Digest,
    pub entry: LayerEntry,
}

#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Entries of `layers`, in any order. One finite pass.
    async fn iter_entries(
        &self,
        bundle: &ResolvedBundle,
        layers: &[String],
    ) -> BundleResult<Vec<MatEntry>>;

    /// Bytes of an inline entry.
    async fn fetch_inline(&self, bundle: &ResolvedBundle, entry: &MatEntry) -> BundleResult<Bytes>;

    /// Bytes of an external entry.
    async fn fetch_external(&self, entry: &MatEntry) -> BundleResult<Bytes>;
}

fn layer_descriptor<'a>(
    bundle: &'a ResolvedBundle,
    name: &str,
) -> BundleResult<&'a strata_core::LayerDescriptor> {
    bundle.layer(name).ok_or_else(|| unknown_layer(name))
}

fn unknown_layer(name: &str) -> BundleError {
    BundleError::validation(format!("layer '{}' is not part of the bundle", name))
}

fn external_uri(entry: &MatEntry) -> BundleResult<ExternalUri> {
    let uri = entry.entry.uri.as_deref().ok_or_else(|| {
        BundleError::validation(format!("entry '{}' has no external uri", entry.entry.path))
    })?;
    ExternalUri::parse(uri)
}

/// Reads layer indexes and inline blobs from a registry and external blobs
/// from an object store.
#[derive(Clone)]
pub struct RegistryContentProvider {
    registry: Arc<dyn BundleRegistry>,
    external: Arc<dyn ExternalStore>,
}

impl RegistryContentProvider {
    pub fn new(registry: Arc<dyn BundleRegistry>, external: Arc<dyn ExternalStore>) -> Self {
        Self { registry, external }
    }

    async fn layer_index(&self, bundle: &ResolvedBundle, name: &str) -> BundleResult<LayerIndex> {
        let descriptor = layer_descriptor(bundle, name)?;
        let index_digest = bundle.layer_index_digests.get(name).ok_or_else(|| {
            BundleError::validation(format!("bundle has no index digest for layer '{}'", name))
        })?;

        let bytes = self.registry.get_blob(index_digest).await?;
        let index = LayerIndex::from_bytes(&bytes)?;
        if index.layer != name {
            return Err(BundleError::validation(format!(
                "index {} describes layer '{}', expected '{}'",
                index_digest, index.layer, name
            )));
        }
        let actual = index.layer_id()?;
        if actual != descriptor.layer_id {
            return Err(BundleError::DigestMismatch {
                subject: format!("layer '{}'", name),
                expected: descriptor.layer_id.to_string(),
                actual: actual.to_string(),
            });
        }
        debug!(layer = %name, entries = index.entries.len(), "layer index loaded");
        Ok(index)
    }
}

#[async_trait]
impl ContentProvider for RegistryContentProvider {
    async fn iter_entries(
        &self,
        bundle: &ResolvedBundle,
        layers: &[String],
    ) -> BundleResult<Vec<MatEntry>> {
        let mut out = Vec::new();
        for name in layers {
            let index = self.layer_index(bundle, name).await?;
            let layer_id = layer_descriptor(bundle, name)?.layer_id.clone();
            out.extend(index.entries.into_iter().map(|entry| MatEntry {
                layer: name.clone(),
                layer_id: layer_id.clone(),
                entry,
            }));
        }
        Ok(out)
    }

    async fn fetch_inline(&self, _bundle: &ResolvedBundle, entry: &MatEntry) -> BundleResult<Bytes> {
        Ok(self.registry.get_blob(&entry.entry.content_hash).await?)
    }

    async fn fetch_external(&self, entry: &MatEntry) -> BundleResult<Bytes> {
        let uri = external_uri(entry)?;
        Ok(self.external.get(&uri).await?)
    }
}

/// Serves a planned working directory straight from its source files.
///
/// External entries are read from the working copy too, so nothing touches
/// the network.
#[derive(Debug, Clone)]
pub struct LocalContentProvider {
    plan: Arc<BundlePlan>,
}

impl LocalContentProvider {
    pub fn new(plan: Arc<BundlePlan>) -> Self {
        Self { plan }
    }

    async fn read_source(&self, entry: &MatEntry) -> BundleResult<Bytes> {
        let source = self
            .plan
            .source_of(&entry.layer, &entry.entry.path)
            .ok_or_else(|| {
                BundleError::not_found(format!(
                    "'{}' in layer '{}' of {}",
                    entry.entry.path,
                    entry.layer,
                    self.plan.root.display()
                ))
            })?;
        read_file(source).await
    }
}

async fn read_file(path: &Path) -> BundleResult<Bytes> {
    tokio::fs::read(path)
        .await
        .map(Bytes::from)
        .map_err(|e| BundleError::io(path, e))
}

#[async_trait]
impl ContentProvider for LocalContentProvider {
    async fn iter_entries(
        &self,
        _bundle: &ResolvedBundle,
        layers: &[String],
    ) -> BundleResult<Vec<MatEntry>> {
        let mut out = Vec::new();
        for name in layers {
            let layer = self.plan.layer(name).ok_or_else(|| unknown_layer(name))?;
            out.extend(layer.files.iter().map(|f| MatEntry {
                layer: name.clone(),
                layer_id: layer.layer_id.clone(),
                entry: f.entry.clone(),
            }));
        }
        Ok(out)
    }

    async fn fetch_inline(&self, _bundle: &ResolvedBundle, entry: &MatEntry) -> BundleResult<Bytes> {
        self.read_source(entry).await
    }

    async fn fetch_external(&self, entry: &MatEntry) -> BundleResult<Bytes> {
        self.read_source(entry).await
    }
}

#[derive(Debug, Default)]
struct StaticState {
    layers: BTreeMap<String, Vec<LayerEntry>>,
    layer_order: Vec<String>,
    blobs: HashMap<Digest, Bytes>,
    external: HashMap<String, Bytes>,
    failing: HashSet<String>,
}

/// In-memory provider for tests and embedding.
///
/// Builds its own [`ResolvedBundle`] so identities are always consistent
/// with the entries it serves.
#[derive(Debug, Clone, Default)]
pub struct StaticContentProvider {
    state: Arc<Mutex<StaticState>>,
    inline_fetches: Arc<AtomicUsize>,
    external_fetches: Arc<AtomicUsize>,
}

impl StaticContentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StaticState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, layer: &str, entry: LayerEntry) {
        let mut state = self.state();
        if !state.layers.contains_key(layer) {
            state.layer_order.push(layer.to_string());
        }
        state.layers.entry(layer.to_string()).or_default().push(entry);
    }

    /// Add an inline file to `layer`.
    pub fn with_inline(self, layer: &str, path: &str, bytes: &[u8], mode: u32) -> Self {
        let hash = Digest::of_bytes(bytes);
        self.state().blobs.insert(hash.clone(), Bytes::copy_from_slice(bytes));
        self.push(layer, LayerEntry::inline(path, mode, bytes.len() as u64, hash));
        self
    }

    /// Add an external file to `layer`, reachable at `uri`.
    pub fn with_external(self, layer: &str, path: &str, uri: &str, bytes: &[u8]) -> Self {
        let hash = Digest::of_bytes(bytes);
        self.state()
            .external
            .insert(uri.to_string(), Bytes::copy_from_slice(bytes));
        self.push(
            layer,
            LayerEntry::external(path, strata_core::FILE_MODE, bytes.len() as u64, hash, uri, None),
        );
        self
    }

    /// Add an entry without any backing bytes.
    pub fn with_entry(self, layer: &str, entry: LayerEntry) -> Self {
        self.push(layer, entry);
        self
    }

    /// Make every fetch of `uri` fail.
    pub fn fail_uri(&self, uri: &str) {
        self.state().failing.insert(uri.to_string());
    }

    pub fn heal_uri(&self, uri: &str) {
        self.state().failing.remove(uri);
    }

    /// Replace the bytes served for `uri`.
    pub fn set_external(&self, uri: &str, bytes: &[u8]) {
        self.state()
            .external
            .insert(uri.to_string(), Bytes::copy_from_slice(bytes));
    }

    pub fn inline_fetches(&self) -> usize {
        self.inline_fetches.load(Ordering::SeqCst)
    }

    pub fn external_fetches(&self) -> usize {
        self.external_fetches.load(Ordering::SeqCst)
    }

    /// Bundle manifest over the layers added so far, in insertion order.
    pub fn manifest(
        &self,
        name: &str,
        version: &str,
        roles: &[(&str, &[&str])],
    ) -> BundleResult<BundleManifest> {
        let state = self.state();
        let mut layers = Vec::new();
        let mut external = false;
        for layer in &state.layer_order {
            let entries = state.layers.get(layer).cloned().unwrap_or_default();
            let index = LayerIndex::new(layer.clone(), entries)?;
            external |= index.has_external();
            layers.push(ManifestLayer {
                name: layer.clone(),
                layer_id: index.layer_id()?,
                index_digest: Digest::of_bytes(&index.to_bytes()?),
            });
        }
        Ok(BundleManifest {
            media_type: media::BUNDLE_MANIFEST.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            description: None,
            annotations: BTreeMap::new(),
            roles: roles
                .iter()
                .map(|(role, layers)| {
                    (role.to_string(), layers.iter().map(|l| l.to_string()).collect())
                })
                .collect(),
            layers,
            external_index_present: external,
        })
    }

    /// Resolved form of [`StaticContentProvider::manifest`].
    pub fn bundle(&self, roles: &[(&str, &[&str])]) -> BundleResult<ResolvedBundle> {
        ResolvedBundle::from_manifest(&self.manifest("static/bundle", "0.0.0", roles)?)
    }
}

#[async_trait]
impl ContentProvider for StaticContentProvider {
    async fn iter_entries(
        &self,
        bundle: &ResolvedBundle,
        layers: &[String],
    ) -> BundleResult<Vec<MatEntry>> {
        let state = self.state();
        let mut out = Vec::new();
        for name in layers {
            let layer_id = layer_descriptor(bundle, name)?.layer_id.clone();
            let entries = state.layers.get(name).ok_or_else(|| unknown_layer(name))?;
            out.extend(entries.iter().map(|entry| MatEntry {
                layer: name.clone(),
                layer_id: layer_id.clone(),
                entry: entry.clone(),
            }));
        }
        Ok(out)
    }

    async fn fetch_inline(&self, _bundle: &ResolvedBundle, entry: &MatEntry) -> BundleResult<Bytes> {
        self.inline_fetches.fetch_add(1, Ordering::SeqCst);
        self.state()
            .blobs
            .get(&entry.entry.content_hash)
            .cloned()
            .ok_or_else(|| BundleError::not_found(format!("blob {}", entry.entry.content_hash)))
    }

    async fn fetch_external(&self, entry: &MatEntry) -> BundleResult<Bytes> {
        self.external_fetches.fetch_add(1, Ordering::SeqCst);
        let uri = external_uri(entry)?.to_string();
        let state = self.state();
        if state.failing.contains(&uri) {
            return Err(BundleError::transport(format!("injected failure for {}", uri)));
        }
        state
            .external
            .get(&uri)
            .cloned()
            .ok_or_else(|| BundleError::not_found(format!("external object {}", uri)))
    }
}
