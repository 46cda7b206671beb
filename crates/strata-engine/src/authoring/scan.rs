//! Working-directory scan.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use strata_core::path::{is_reserved, normalize_relpath, relpath_of};
use strata_core::{BundleError, BundleResult, Digest};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::spec::SPEC_FILE_NAMES;
use crate::fsutil::{self, TEMP_PREFIX};

/// A regular file found in a working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedFile {
    /// Normalized bundle path.
    pub path: String,
    #[serde(skip)]
    pub source: PathBuf,
    pub size: u64,
    pub mode: u32,
    pub content_hash: Digest,
}

/// Every regular file under `root`, sorted by path bytes.
///
/// Skips the spec file, the reserved `.strata/` tree and engine temp files.
/// Symlinks to files are followed; symlinked directories are skipped.
pub fn scan_dir(root: &Path) -> BundleResult<Vec<ScannedFile>> {
    if !root.is_dir() {
        return Err(BundleError::not_found(format!(
            "working directory {}",
            root.display()
        )));
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_skipped_name(e.file_name().to_str()));

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            BundleError::io(&path, e.into())
        })?;
        if entry.depth() == 0 {
            continue;
        }

        let rel = relpath_of(root, entry.path())?;
        if is_reserved(&rel) || (entry.depth() == 1 && SPEC_FILE_NAMES.contains(&rel.as_str())) {
            continue;
        }

        let meta = if entry.file_type().is_symlink() {
            match fs::metadata(entry.path()) {
                Ok(meta) if meta.is_file() => meta,
                _ => {
                    warn!(path = %rel, "skipping symlink that does not point at a regular file");
                    continue;
                }
            }
        } else if entry.file_type().is_file() {
            entry.metadata().map_err(|e| BundleError::io(entry.path(), e.into()))?
        } else {
            continue;
        };

        let path = normalize_relpath(&rel)?;
        files.push(ScannedFile {
            source: entry.path().to_path_buf(),
            size: meta.len(),
            mode: fsutil::mode_of(&meta),
            content_hash: fsutil::hash_file(entry.path())?,
            path,
        });
    }

    files.sort_by(|a, b| a.path.as_bytes().cmp(b.path.as_bytes()));
    debug!(root = %root.display(), files = files.len(), "working directory scanned");
    Ok(files)
}

fn is_skipped_name(name: Option<&str>) -> bool {
    match name {
        Some(name) => name.starts_with(TEMP_PREFIX),
        None => false,
    }
}
