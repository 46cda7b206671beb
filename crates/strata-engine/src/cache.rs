//! Content-addressed blob cache shared across materializations.
//!
//! # Cache Structure
//!
//! ```text
//! <root>/
//!   .locks/sha256-<manifest>.lock          # fs2 advisory lock per bundle
//!   sha256-<manifest>/
//!     layers/sha256-<layer>/<content hex>  # verified blob
//! ```
//!
//! A blob is written once, under the bundle lock, and never re-hashed after
//! it reaches its final path. Blobs are stored read-only so a hardlinked
//! destination file cannot be edited in place. Nothing is evicted.

use std::fs::{self, File};
use std::future::Future;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use strata_core::{BundleError, BundleResult, Digest};
use tracing::{debug, warn};

use crate::fsutil;

const LOCK_DIR: &str = ".locks";
const LAYERS_DIR: &str = "layers";
/// Permission bits of a cached blob. Normalizes to `FILE_MODE`.
const BLOB_MODE: u32 = 0o444;

/// How cached blobs reach a destination tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Hardlink, falling back to a copy when linking fails.
    #[default]
    Hardlink,
    Copy,
}

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub link_mode: LinkMode,
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            link_mode: LinkMode::default(),
        }
    }

    pub fn with_link_mode(mut self, link_mode: LinkMode) -> Self {
        self.link_mode = link_mode;
        self
    }

    /// Platform cache directory: `~/.cache/strata` on Linux.
    pub fn default_root() -> BundleResult<PathBuf> {
        let base = dirs::cache_dir().or_else(dirs::home_dir).ok_or_else(|| {
            BundleError::validation("could not determine a cache directory; set STRATA_CACHE_DIR")
        })?;
        Ok(base.join("strata"))
    }
}

/// Blob cache rooted at [`CacheConfig::root`].
#[derive(Debug, Clone)]
pub struct ContentCache {
    config: CacheConfig,
}

/// Held for the duration of a blob write; released on drop.
struct BundleLock {
    _file: File,
}

impl BundleLock {
    fn acquire(path: &Path) -> BundleResult<Self> {
        if let Some(parent) = path.parent() {
            fsutil::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| BundleError::io(path, e))?;
        file.lock_exclusive().map_err(|e| BundleError::io(path, e))?;
        Ok(Self { _file: file })
    }
}

impl ContentCache {
    pub fn new(config: CacheConfig) -> Self {
        Self { config }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn link_mode(&self) -> LinkMode {
        self.config.link_mode
    }

    /// `root/<manifestKey>`.
    pub fn bundle_dir(&self, manifest: &Digest) -> PathBuf {
        self.config.root.join(manifest.key())
    }

    /// Final location of a verified blob.
    pub fn blob_path(&self, manifest: &Digest, layer_id: &Digest, content_hash: &Digest) -> PathBuf {
        self.bundle_dir(manifest)
            .join(LAYERS_DIR)
            .join(layer_id.key())
            .join(content_hash.hex())
    }

    fn lock_path(&self, manifest: &Digest) -> PathBuf {
        self.config
            .root
            .join(LOCK_DIR)
            .join(format!("{}.lock", manifest.key()))
    }

    /// Create the bundle directory and nothing else.
    pub async fn prime(&self, manifest: &Digest) -> BundleResult<PathBuf> {
        let dir = self.bundle_dir(manifest);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BundleError::io(&dir, e))?;
        debug!(manifest = %manifest, dir = %dir.display(), "cache primed");
        Ok(dir)
    }

    /// Return the path of a verified blob, fetching it on first use.
    ///
    /// `fetch` runs at most once per call and only while the bundle lock is
    /// held, so concurrent callers (threads or processes) never both write.
    pub async fn ensure_blob<F, Fut>(
        &self,
        manifest: &Digest,
        layer_id: &Digest,
        content_hash: &Digest,
        fetch: F,
    ) -> BundleResult<PathBuf>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BundleResult<Bytes>>,
    {
        let path = self.blob_path(manifest, layer_id, content_hash);
        if path.is_file() {
            return Ok(path);
        }

        let lock_path = self.lock_path(manifest);
        let lock = fsutil::blocking(move || BundleLock::acquire(&lock_path)).await?;

        // Another holder may have finished the write while we waited.
        if path.is_file() {
            drop(lock);
            return Ok(path);
        }

        let bytes = fetch().await?;
        let expected = content_hash.clone();
        let target = path.clone();
        fsutil::blocking(move || {
            fsutil::write_atomic_checked(&target, &bytes, BLOB_MODE, |written| {
                let actual = Digest::of_bytes(written);
                if actual == expected {
                    Ok(())
                } else {
                    Err(BundleError::DigestMismatch {
                        subject: format!("cached blob {}", expected),
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    })
                }
            })
        })
        .await?;
        drop(lock);

        debug!(blob = %content_hash, path = %path.display(), "blob cached");
        Ok(path)
    }

    /// Place a cached blob at `target`.
    ///
    /// Hardlinks share permission bits with the cache entry, so a blob is only
    /// linked when `mode` matches the cached file's normalized mode. Linked
    /// files are read-only; copies get `mode` as given.
    pub fn populate(&self, blob: &Path, target: &Path, mode: u32) -> BundleResult<()> {
        if self.config.link_mode == LinkMode::Hardlink {
            let cached_mode = fs::metadata(blob)
                .map(|m| fsutil::mode_of(&m))
                .map_err(|e| BundleError::io(blob, e))?;
            if cached_mode == mode {
                match fsutil::link_atomic(blob, target) {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(
                            blob = %blob.display(),
                            target = %target.display(),
                            error = %e,
                            "hardlink failed, copying instead"
                        );
                    }
                }
            }
        }
        fsutil::copy_atomic(blob, target, mode)
    }
}
