//! Bundle resolution.
//!
//! Resolves a [`BundleRef`] to an immutable [`ResolvedBundle`]:
//! 1. Local working directory (planned from its `strata.yaml`, no network)
//! 2. Registry digest, then the identity alias tag `sha256-<hex>`
//! 3. Registry version tag `<name with '/'→'.'>--<version with '+'→'_'>`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_core::reference::{digest_alias_tag, version_tag};
use strata_core::{
    BundleError, BundleManifest, BundleMetadata, BundleRef, BundleResult, Digest, OciManifest,
    ResolvedBundle, Selector,
};
use strata_storage::{BundleRegistry, ExternalStore, ManifestResponse, StorageError};
use tracing::{debug, info};

use crate::authoring::BundlePlan;
use crate::cache::ContentCache;
use crate::fsutil;
use crate::provider::{ContentProvider, LocalContentProvider, RegistryContentProvider};

/// Where a bundle was resolved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveSource {
    /// Planned from a working directory.
    Local(PathBuf),

    /// Fetched from a registry under `reference`.
    Registry { location: String, reference: String },

    /// Built by the caller.
    Provided,
}

impl std::fmt::Display for ResolveSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(path) => write!(f, "local:{}", path.display()),
            Self::Registry {
                location,
                reference,
            } => write!(f, "registry:{}@{}", location, reference),
            Self::Provided => write!(f, "provided"),
        }
    }
}

/// Resolver configuration.
#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    /// Create `cacheRoot/<manifestKey>/` after resolving.
    pub prime_cache: bool,
}

impl ResolverConfig {
    pub fn prime_cache(mut self) -> Self {
        self.prime_cache = true;
        self
    }
}

/// Outcome of a resolve call.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub bundle: ResolvedBundle,
    pub metadata: BundleMetadata,
    pub source: ResolveSource,
    /// Role hint carried by the reference.
    pub role_hint: Option<String>,
    /// Plan of a local working directory.
    pub local_plan: Option<Arc<BundlePlan>>,
}

impl Resolution {
    /// Wrap a bundle built outside the resolver.
    pub fn provided(bundle: ResolvedBundle) -> Self {
        Self {
            bundle,
            metadata: BundleMetadata::default(),
            source: ResolveSource::Provided,
            role_hint: None,
            local_plan: None,
        }
    }

    pub fn with_role_hint(mut self, role: impl Into<String>) -> Self {
        self.role_hint = Some(role.into());
        self
    }
}

/// Bundle resolver.
pub struct BundleResolver {
    /// Registry client; `None` resolves local paths only.
    registry: Option<Arc<dyn BundleRegistry>>,

    /// Content cache, primed on request.
    cache: Option<ContentCache>,

    config: ResolverConfig,
}

impl BundleResolver {
    /// Resolver that only understands local paths.
    pub fn local_only() -> Self {
        Self {
            registry: None,
            cache: None,
            config: ResolverConfig::default(),
        }
    }

    pub fn new(registry: Arc<dyn BundleRegistry>) -> Self {
        Self {
            registry: Some(registry),
            cache: None,
            config: ResolverConfig::default(),
        }
    }

    pub fn with_cache(mut self, cache: ContentCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_config(mut self, config: ResolverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> Option<&Arc<dyn BundleRegistry>> {
        self.registry.as_ref()
    }

    /// Parse and resolve a textual reference.
    pub async fn resolve_str(&self, reference: &str) -> BundleResult<Resolution> {
        self.resolve(&BundleRef::parse(reference)?).await
    }

    /// Resolve a reference.
    pub async fn resolve(&self, reference: &BundleRef) -> BundleResult<Resolution> {
        let mut resolution = match reference.selector()? {
            Selector::LocalPath(path) => self.resolve_local(path).await?,
            Selector::Digest(digest) => self.resolve_digest(&digest).await?,
            Selector::NameVersion { name, version } => {
                self.resolve_name_version(name, version).await?
            }
        };
        resolution.role_hint = reference.role.clone();

        if self.config.prime_cache {
            if let Some(cache) = &self.cache {
                let dir = cache.prime(&resolution.bundle.manifest_digest).await?;
                resolution.bundle.cache_dir = Some(dir);
            }
        }

        info!(
            digest = %resolution.bundle.manifest_digest,
            source = %resolution.source,
            layers = resolution.bundle.layers.len(),
            "bundle resolved"
        );
        Ok(resolution)
    }

    /// Content provider matching how `resolution` was produced.
    pub fn provider_for(
        &self,
        resolution: &Resolution,
        external: Arc<dyn ExternalStore>,
    ) -> BundleResult<Arc<dyn ContentProvider>> {
        if let Some(plan) = &resolution.local_plan {
            return Ok(Arc::new(LocalContentProvider::new(plan.clone())));
        }
        let registry = self.require_registry()?;
        Ok(Arc::new(RegistryContentProvider::new(registry.clone(), external)))
    }

    fn require_registry(&self) -> BundleResult<&Arc<dyn BundleRegistry>> {
        self.registry.as_ref().ok_or_else(|| {
            BundleError::validation(
                "no registry configured; set STRATA_REGISTRY_URL and STRATA_REGISTRY_REPO",
            )
        })
    }

    async fn resolve_local(&self, path: &Path) -> BundleResult<Resolution> {
        debug!(path = %path.display(), "resolving local working directory");
        if !path.is_dir() {
            return Err(BundleError::not_found(format!(
                "local bundle directory {}",
                path.display()
            )));
        }

        let root = path.to_path_buf();
        let plan = fsutil::blocking(move || BundlePlan::build(&root)).await?;
        Ok(Resolution {
            bundle: plan.resolved()?,
            metadata: plan.metadata(),
            source: ResolveSource::Local(path.to_path_buf()),
            role_hint: None,
            local_plan: Some(Arc::new(plan)),
        })
    }

    async fn resolve_digest(&self, digest: &Digest) -> BundleResult<Resolution> {
        let registry = self.require_registry()?;

        match registry.get_manifest(digest.as_str()).await {
            Ok(response) => {
                debug!(digest = %digest, "matched registry manifest digest");
                self.from_envelope(registry, digest.as_str(), response).await
            }
            Err(StorageError::NotFound { .. }) => {
                let alias = digest_alias_tag(digest);
                debug!(alias = %alias, "no manifest with that registry digest, trying identity alias");
                let response = registry.get_manifest(&alias).await.map_err(|e| match e {
                    StorageError::NotFound { .. } => BundleError::not_found(format!(
                        "bundle {} in {}",
                        digest,
                        registry.location()
                    )),
                    other => other.into(),
                })?;
                let resolution = self.from_envelope(registry, &alias, response).await?;
                if &resolution.bundle.manifest_digest != digest {
                    return Err(BundleError::DigestMismatch {
                        subject: format!("bundle identity behind tag {}", alias),
                        expected: digest.to_string(),
                        actual: resolution.bundle.manifest_digest.to_string(),
                    });
                }
                Ok(resolution)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_name_version(&self, name: &str, version: &str) -> BundleResult<Resolution> {
        let registry = self.require_registry()?;
        let tag = version_tag(name, version);
        debug!(name = %name, version = %version, tag = %tag, "resolving version tag");

        let response = registry.get_manifest(&tag).await.map_err(|e| match e {
            StorageError::NotFound { .. } => BundleError::not_found(format!(
                "bundle {}:{} in {}",
                name,
                version,
                registry.location()
            )),
            other => other.into(),
        })?;
        let resolution = self.from_envelope(registry, &tag, response).await?;
        if resolution.metadata.name.as_deref() != Some(name)
            || resolution.metadata.version.as_deref() != Some(version)
        {
            debug!(
                tag = %tag,
                manifest_name = ?resolution.metadata.name,
                manifest_version = ?resolution.metadata.version,
                "tag points at a bundle published under another name"
            );
        }
        Ok(resolution)
    }

    async fn from_envelope(
        &self,
        registry: &Arc<dyn BundleRegistry>,
        reference: &str,
        response: ManifestResponse,
    ) -> BundleResult<Resolution> {
        let declared = Some(response.media_type.as_str()).filter(|m| !m.is_empty());
        let envelope = OciManifest::from_bytes(&response.bytes, declared)?;
        let descriptor = envelope.bundle_manifest()?;

        let bytes = registry.get_blob(&descriptor.digest).await?;
        let manifest = BundleManifest::from_bytes(&bytes)?;

        for layer in &manifest.layers {
            if !envelope.layers.iter().any(|d| d.digest == layer.index_digest) {
                return Err(BundleError::validation(format!(
                    "layer '{}' index {} is not referenced by the registry manifest",
                    layer.name, layer.index_digest
                )));
            }
        }

        let bundle = ResolvedBundle::from_manifest(&manifest)?;
        let mut metadata = BundleMetadata::from_manifest(&manifest);
        metadata.registry_digest = Some(response.digest);

        Ok(Resolution {
            bundle,
            metadata,
            source: ResolveSource::Registry {
                location: registry.location(),
                reference: reference.to_string(),
            },
            role_hint: None,
            local_plan: None,
        })
    }
}
