//! Archive import with verification.
//!
//! Entries are unpacked into a staging directory next to the destination.
//! Structural violations reject the archive; recoverable deviations from the
//! export pins become warnings. Files are verified against the provenance
//! record and pointers carried in the archive (or a caller-supplied map),
//! and only a fully verified tree is renamed into place.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use serde::Serialize;
use strata_core::path::{
    is_reserved, join_under, normalize_relpath, original_from_pointer, provenance_relpath,
};
use strata_core::{BundleError, BundleResult, Digest, PointerFile, Provenance, EXEC_MODE, FILE_MODE};
use tar::EntryType;
use tracing::{debug, info, warn};

use crate::export::DIR_MODE;
use crate::fsutil::{self, HashingWriter, TEMP_PREFIX};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    Tar,
    Gzip,
    Zstd,
}

impl ArchiveFormat {
    pub fn detect(head: &[u8]) -> Self {
        if head.starts_with(GZIP_MAGIC) {
            Self::Gzip
        } else if head.starts_with(ZSTD_MAGIC) {
            Self::Zstd
        } else {
            Self::Tar
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Path to hash map that replaces the inventory carried by the archive.
    pub expected: Option<BTreeMap<String, Digest>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub dest: PathBuf,
    pub format: ArchiveFormat,
    pub files: usize,
    pub directories: usize,
    /// Files checked against the inventory.
    pub verified: usize,
    pub warnings: Vec<String>,
}

fn open_archive(path: &Path) -> BundleResult<(ArchiveFormat, Box<dyn Read>)> {
    let mut head = [0_u8; 4];
    let mut file = File::open(path).map_err(|e| BundleError::io(path, e))?;
    let n = read_prefix(&mut file, &mut head).map_err(|e| BundleError::io(path, e))?;
    let format = ArchiveFormat::detect(&head[..n]);

    let file = BufReader::new(File::open(path).map_err(|e| BundleError::io(path, e))?);
    let reader: Box<dyn Read> = match format {
        ArchiveFormat::Tar => Box::new(file),
        ArchiveFormat::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
        ArchiveFormat::Zstd => {
            Box::new(zstd::Decoder::with_buffer(file).map_err(|e| BundleError::io(path, e))?)
        }
    };
    Ok((format, reader))
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Header fields that deviate from the export pins, by field name.
#[derive(Default)]
struct Deviations {
    counts: BTreeMap<&'static str, usize>,
    out_of_order: Option<String>,
}

impl Deviations {
    fn note(&mut self, field: &'static str) {
        *self.counts.entry(field).or_default() += 1;
    }

    fn check(&mut self, header: &tar::Header, is_dir: bool) {
        if header.uid().ok() != Some(0) {
            self.note("uid");
        }
        if header.gid().ok() != Some(0) {
            self.note("gid");
        }
        if header.mtime().ok() != Some(0) {
            self.note("mtime");
        }
        if !matches!(header.username(), Ok(None) | Ok(Some(""))) {
            self.note("uname");
        }
        if !matches!(header.groupname(), Ok(None) | Ok(Some(""))) {
            self.note("gname");
        }
        let mode = header.mode().unwrap_or(0) & 0o7777;
        let pinned = if is_dir {
            mode == DIR_MODE
        } else {
            mode == FILE_MODE || mode == EXEC_MODE
        };
        if !pinned {
            self.note("mode");
        }
    }

    fn into_warnings(self) -> Vec<String> {
        let mut out: Vec<String> = self
            .counts
            .into_iter()
            .map(|(field, n)| format!("{} entries have an unpinned {}", n, field))
            .collect();
        if let Some(path) = self.out_of_order {
            out.insert(0, format!("entries are not in path order (first at '{}')", path));
        }
        out
    }
}

/// Unpacked but unverified archive contents.
struct Unpacked {
    files: BTreeMap<String, Digest>,
    directories: usize,
    warnings: Vec<String>,
}

fn unpack(reader: Box<dyn Read>, staging: &Path) -> BundleResult<Unpacked> {
    let mut archive = tar::Archive::new(reader);
    let mut violations = Vec::new();
    let mut deviations = Deviations::default();
    let mut seen = BTreeSet::new();
    let mut dirs = BTreeSet::new();
    let mut files = BTreeMap::new();
    let mut previous: Option<String> = None;

    let entries = archive.entries().map_err(|e| BundleError::io(staging, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| BundleError::io(staging, e))?;
        let raw = match String::from_utf8(entry.path_bytes().into_owned()) {
            Ok(raw) => raw,
            Err(e) => {
                violations.push(format!(
                    "{}: name is not valid UTF-8",
                    String::from_utf8_lossy(e.as_bytes())
                ));
                continue;
            }
        };

        let entry_type = entry.header().entry_type();
        let is_dir = match entry_type {
            EntryType::Directory => true,
            EntryType::Regular | EntryType::Continuous => false,
            other => {
                violations.push(format!("{}: unsupported entry type {:?}", raw, other));
                continue;
            }
        };

        let trimmed = if is_dir { raw.trim_end_matches('/') } else { raw.as_str() };
        let path = match normalize_relpath(trimmed) {
            Ok(path) if path == trimmed => path,
            Ok(path) => {
                violations.push(format!("{}: not in normalized form '{}'", raw, path));
                continue;
            }
            Err(e) => {
                violations.push(format!("{}: {}", raw, e));
                continue;
            }
        };

        if !seen.insert(path.clone()) {
            violations.push(format!("{}: duplicate entry", path));
            continue;
        }
        if let Some((parent, _)) = path.rsplit_once('/') {
            if !dirs.contains(parent) {
                violations.push(format!("{}: parent directory entry '{}' not seen", path, parent));
                continue;
            }
        }
        if let Some(prev) = &previous {
            if prev.as_bytes() > path.as_bytes() && deviations.out_of_order.is_none() {
                deviations.out_of_order = Some(path.clone());
            }
        }
        previous = Some(path.clone());
        deviations.check(entry.header(), is_dir);

        if !violations.is_empty() {
            // Keep scanning for the report but stop writing.
            if is_dir {
                dirs.insert(path);
            }
            continue;
        }

        let target = join_under(staging, &path)?;
        if is_dir {
            fsutil::create_dir_all(&target)?;
            fsutil::set_mode(&target, DIR_MODE)?;
            dirs.insert(path);
            continue;
        }

        let mode = match entry.header().mode() {
            Ok(m) if m & 0o111 != 0 => EXEC_MODE,
            _ => FILE_MODE,
        };
        let out = File::create(&target).map_err(|e| BundleError::io(&target, e))?;
        let mut sink = HashingWriter::new(out);
        io::copy(&mut entry, &mut sink).map_err(|e| BundleError::io(&target, e))?;
        let (out, digest, _) = sink.finish();
        out.sync_all().map_err(|e| BundleError::io(&target, e))?;
        fsutil::set_mode(&target, mode)?;
        files.insert(path, digest);
    }

    if !violations.is_empty() {
        return Err(BundleError::archive_rejected(violations));
    }
    Ok(Unpacked {
        files,
        directories: dirs.len(),
        warnings: deviations.into_warnings(),
    })
}

/// Inventory carried by the archive: provenance files plus pointer targets.
///
/// A fulfilled pointer whose data is absent is rewritten as unfulfilled.
fn carried_inventory(
    staging: &Path,
    files: &BTreeMap<String, Digest>,
    warnings: &mut Vec<String>,
) -> BundleResult<Option<BTreeMap<String, Digest>>> {
    let mut inventory = BTreeMap::new();
    let mut found = false;

    let provenance = provenance_relpath();
    if files.contains_key(&provenance) {
        let path = join_under(staging, &provenance)?;
        let bytes = fs::read(&path).map_err(|e| BundleError::io(&path, e))?;
        inventory.extend(Provenance::from_bytes(&bytes)?.files);
        found = true;
    }

    for rel in files.keys() {
        let Some(original) = original_from_pointer(rel) else {
            continue;
        };
        found = true;
        let path = join_under(staging, rel)?;
        let bytes = fs::read(&path).map_err(|e| BundleError::io(&path, e))?;
        let pointer = PointerFile::from_bytes(&bytes)?;

        if files.contains_key(&original) {
            inventory.insert(original, pointer.content_hash.clone());
        } else if pointer.fulfilled {
            warnings.push(format!(
                "{}: data not in archive, pointer marked unfulfilled",
                original
            ));
            let bytes = pointer.unfulfilled().to_bytes()?;
            fsutil::write_atomic(&path, &bytes, FILE_MODE)?;
        }
    }

    Ok(found.then_some(inventory))
}

fn mismatches(inventory: &BTreeMap<String, Digest>, files: &BTreeMap<String, Digest>) -> Vec<String> {
    let mut out = Vec::new();
    for (path, expected) in inventory {
        match files.get(path) {
            None => out.push(format!("{}: missing", path)),
            Some(actual) if actual != expected => out.push(format!(
                "{}: expected {}, found {}",
                path, expected, actual
            )),
            Some(_) => {}
        }
    }
    for path in files.keys() {
        if !is_reserved(path) && !inventory.contains_key(path) {
            out.push(format!("{}: not in inventory", path));
        }
    }
    out.sort();
    out
}

/// Unpack and verify `archive` into `dest`, which must be absent or empty.
pub fn import_archive(
    archive: &Path,
    dest: &Path,
    options: &ImportOptions,
) -> BundleResult<ImportReport> {
    if !archive.is_file() {
        return Err(BundleError::not_found(format!("archive {}", archive.display())));
    }
    if !fsutil::is_absent_or_empty(dest)? {
        return Err(BundleError::validation(format!(
            "import destination {} is not empty",
            dest.display()
        )));
    }

    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fsutil::create_dir_all(&parent)?;
    let staging = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempdir_in(&parent)
        .map_err(|e| BundleError::io(&parent, e))?;

    let (format, reader) = open_archive(archive)?;
    debug!(archive = %archive.display(), format = ?format, "unpacking");
    let Unpacked {
        files,
        directories,
        mut warnings,
    } = unpack(reader, staging.path())?;

    let inventory = match &options.expected {
        Some(map) => Some(map.clone()),
        None => carried_inventory(staging.path(), &files, &mut warnings)?,
    };
    let verified = match &inventory {
        Some(inventory) => {
            let problems = mismatches(inventory, &files);
            if !problems.is_empty() {
                return Err(BundleError::import_mismatch(problems));
            }
            inventory.len()
        }
        None => {
            warnings.push("archive carries no provenance record or pointers; files not verified".to_string());
            0
        }
    };

    if dest.exists() {
        fs::remove_dir(dest).map_err(|e| BundleError::io(dest, e))?;
    }
    let staged = staging.keep();
    fsutil::set_mode(&staged, DIR_MODE)?;
    if let Err(e) = fs::rename(&staged, dest) {
        let _ = fs::remove_dir_all(&staged);
        return Err(BundleError::io(dest, e));
    }

    for warning in &warnings {
        warn!(archive = %archive.display(), "{}", warning);
    }
    info!(
        archive = %archive.display(),
        dest = %dest.display(),
        files = files.len(),
        verified,
        "archive imported"
    );
    Ok(ImportReport {
        dest: dest.to_path_buf(),
        format,
        files: files.len(),
        directories,
        verified,
        warnings,
    })
}
