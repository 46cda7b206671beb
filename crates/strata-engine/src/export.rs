//! Deterministic archive export.
//!
//! The same tree always yields the same archive bytes:
//! - ustar headers with uid/gid 0, empty uname/gname, mtime 0
//! - directories 0755, files 0644 or 0755
//! - entries sorted by path bytes, so every directory precedes its children
//! - gzip with header mtime 0 and OS byte 255, or zstd without a checksum
//!
//! Codec crates are pinned exactly in the workspace manifest; a codec
//! upgrade may change compressed output.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use flate2::write::GzEncoder;
use flate2::GzBuilder;
use serde::{Deserialize, Serialize};
use strata_core::path::{is_reserved, normalize_relpath, pointer_relpath};
use strata_core::{BundleError, BundleResult, Digest, EXEC_MODE, FILE_MODE};
use tar::{Builder, EntryType, Header};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::fsutil::{self, HashingWriter, TEMP_PREFIX};

pub const DIR_MODE: u32 = 0o755;

/// ustar limits for the name and prefix fields.
const USTAR_NAME_MAX: usize = 100;
const USTAR_PREFIX_MAX: usize = 155;

pub const GZIP_DEFAULT_LEVEL: i32 = 9;
pub const ZSTD_DEFAULT_LEVEL: i32 = 19;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// Conventional file suffix.
    pub fn extension(self) -> &'static str {
        match self {
            Self::None => "tar",
            Self::Gzip => "tar.gz",
            Self::Zstd => "tar.zst",
        }
    }

    fn level(self, requested: Option<i32>) -> BundleResult<i32> {
        let (default, range) = match self {
            Self::None => {
                return match requested {
                    None => Ok(0),
                    Some(_) => Err(BundleError::validation(
                        "a compression level needs --compression gzip or zstd",
                    )),
                }
            }
            Self::Gzip => (GZIP_DEFAULT_LEVEL, 0..=9),
            Self::Zstd => (ZSTD_DEFAULT_LEVEL, 1..=22),
        };
        let level = requested.unwrap_or(default);
        if !range.contains(&level) {
            return Err(BundleError::validation(format!(
                "{} level {} is outside {}..={}",
                self,
                level,
                range.start(),
                range.end()
            )));
        }
        Ok(level)
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
        })
    }
}

impl FromStr for Compression {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "gzip" | "gz" => Ok(Self::Gzip),
            "zstd" | "zst" => Ok(Self::Zstd),
            other => Err(BundleError::validation(format!(
                "unknown compression '{}' (expected none, gzip or zstd)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub compression: Compression,
    /// Codec level; the codec default when `None`.
    pub level: Option<i32>,
    /// Keep data files that have a pointer next to them.
    pub include_external: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportReport {
    pub output: PathBuf,
    pub compression: Compression,
    /// sha256 of the archive bytes.
    pub digest: Digest,
    pub size: u64,
    pub files: usize,
    pub directories: usize,
    /// Pointer-backed data files left out.
    pub excluded: usize,
    /// Engine temp files left out.
    pub skipped_temp: usize,
}

#[derive(Debug)]
enum Node {
    Directory,
    File { source: PathBuf, size: u64, mode: u32 },
}

/// Whether `path` fits ustar's name field or splits into prefix + name.
pub fn fits_ustar(path: &str) -> bool {
    let bytes = path.as_bytes();
    if bytes.len() <= USTAR_NAME_MAX {
        return true;
    }
    bytes.iter().enumerate().any(|(i, b)| {
        *b == b'/'
            && i <= USTAR_PREFIX_MAX
            && bytes.len() - i - 1 <= USTAR_NAME_MAX
            && i + 1 < bytes.len()
    })
}

/// Walk `src` and collect archive members, rejecting what cannot be exported.
fn collect(
    src: &Path,
    skip: Option<&Path>,
    include_external: bool,
) -> BundleResult<(Vec<(String, Node)>, usize, usize)> {
    let mut nodes = Vec::new();
    let mut offenders = Vec::new();
    let mut seen = BTreeSet::new();
    let mut skipped_temp = 0;

    let walker = WalkDir::new(src)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            let temp = e.depth() > 0
                && e.file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with(TEMP_PREFIX));
            if temp {
                skipped_temp += 1;
            }
            !temp
        });
    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| src.to_path_buf());
            BundleError::io(&path, e.into())
        })?;
        if entry.depth() == 0 || Some(entry.path()) == skip {
            continue;
        }

        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let Some(raw) = rel.to_str() else {
            offenders.push(format!("{}: name is not valid UTF-8", rel.to_string_lossy()));
            continue;
        };
        let raw = raw.replace(std::path::MAIN_SEPARATOR, "/");

        let path = match normalize_relpath(&raw) {
            Ok(path) => path,
            Err(e) => {
                offenders.push(format!("{}: {}", raw, e));
                continue;
            }
        };

        let file_type = entry.file_type();
        let node = if file_type.is_symlink() {
            offenders.push(format!("{}: symlink", path));
            continue;
        } else if file_type.is_dir() {
            Node::Directory
        } else if file_type.is_file() {
            let meta = entry
                .metadata()
                .map_err(|e| BundleError::io(entry.path(), e.into()))?;
            Node::File {
                source: entry.path().to_path_buf(),
                size: meta.len(),
                mode: fsutil::mode_of(&meta),
            }
        } else {
            offenders.push(format!("{}: special file", path));
            continue;
        };

        let member = match node {
            Node::Directory => format!("{}/", path),
            Node::File { .. } => path.clone(),
        };
        if !fits_ustar(&member) {
            offenders.push(format!("{}: name does not fit a ustar header", path));
            continue;
        }
        // Distinct on-disk names may normalize to one member name.
        if !seen.insert(path.clone()) {
            offenders.push(format!("{}: duplicate name after normalization", path));
            continue;
        }
        nodes.push((path, node));
    }

    if !offenders.is_empty() {
        offenders.sort();
        return Err(BundleError::archive_rejected(offenders));
    }

    let mut excluded = 0;
    if !include_external {
        let present: BTreeSet<String> = nodes.iter().map(|(p, _)| p.clone()).collect();
        nodes.retain(|(path, node)| {
            let backed = matches!(node, Node::File { .. })
                && !is_reserved(path)
                && present.contains(&pointer_relpath(path));
            if backed {
                debug!(path = %path, "leaving out pointer-backed data file");
                excluded += 1;
            }
            !backed
        });
    }

    nodes.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    Ok((nodes, excluded, skipped_temp))
}

fn header_for(path: &str, node: &Node) -> BundleResult<Header> {
    let mut header = Header::new_ustar();
    let (member, entry_type, size, mode) = match node {
        Node::Directory => (format!("{}/", path), EntryType::Directory, 0, DIR_MODE),
        Node::File { size, mode, .. } => {
            let mode = if mode & 0o111 != 0 { EXEC_MODE } else { FILE_MODE };
            (path.to_string(), EntryType::Regular, *size, mode)
        }
    };
    header
        .set_path(&member)
        .map_err(|e| BundleError::io(Path::new(path), e))?;
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header
        .set_username("")
        .map_err(|e| BundleError::io(Path::new(path), e))?;
    header
        .set_groupname("")
        .map_err(|e| BundleError::io(Path::new(path), e))?;
    header.set_cksum();
    Ok(header)
}

/// Compression stage between the tar builder and the output file.
enum Encoder<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
    Zstd(zstd::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    fn new(inner: W, compression: Compression, level: i32) -> io::Result<Self> {
        Ok(match compression {
            Compression::None => Self::Plain(inner),
            Compression::Gzip => Self::Gzip(
                GzBuilder::new()
                    .mtime(0)
                    .operating_system(255)
                    .write(inner, flate2::Compression::new(level as u32)),
            ),
            Compression::Zstd => {
                let mut encoder = zstd::Encoder::new(inner, level)?;
                encoder.include_checksum(false)?;
                Self::Zstd(encoder)
            }
        })
    }

    fn finish(self) -> io::Result<W> {
        match self {
            Self::Plain(w) => Ok(w),
            Self::Gzip(e) => e.finish(),
            Self::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Gzip(e) => e.write(buf),
            Self::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Gzip(e) => e.flush(),
            Self::Zstd(e) => e.flush(),
        }
    }
}

/// Archive `src` into `out`. The output appears atomically.
pub fn export_dir(src: &Path, out: &Path, options: &ExportOptions) -> BundleResult<ExportReport> {
    if !src.is_dir() {
        return Err(BundleError::not_found(format!(
            "source directory {}",
            src.display()
        )));
    }
    let level = options.compression.level(options.level)?;
    let src = src.canonicalize().map_err(|e| BundleError::io(src, e))?;

    let out_dir = match out.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fsutil::create_dir_all(&out_dir)?;
    let out_dir = out_dir.canonicalize().map_err(|e| BundleError::io(&out_dir, e))?;
    let file_name = out.file_name().ok_or_else(|| {
        BundleError::validation(format!("{} is not a file path", out.display()))
    })?;
    let out_abs = out_dir.join(file_name);

    let (nodes, excluded, skipped_temp) = collect(&src, Some(&out_abs), options.include_external)?;

    let tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(&out_dir)
        .map_err(|e| BundleError::io(&out_dir, e))?;
    let sink = HashingWriter::new(BufWriter::new(
        tmp.reopen().map_err(|e| BundleError::io(tmp.path(), e))?,
    ));
    let encoder =
        Encoder::new(sink, options.compression, level).map_err(|e| BundleError::io(&out_abs, e))?;
    let mut builder = Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);

    let (mut files, mut directories) = (0, 0);
    for (path, node) in &nodes {
        let header = header_for(path, node)?;
        match node {
            Node::Directory => {
                builder
                    .append(&header, io::empty())
                    .map_err(|e| BundleError::io(&out_abs, e))?;
                directories += 1;
            }
            Node::File { source, size, .. } => {
                let file = File::open(source).map_err(|e| BundleError::io(source, e))?;
                let current = file.metadata().map_err(|e| BundleError::io(source, e))?.len();
                if current != *size {
                    return Err(BundleError::io(
                        source,
                        io::Error::other("file changed size during export"),
                    ));
                }
                builder
                    .append(&header, file)
                    .map_err(|e| BundleError::io(source, e))?;
                files += 1;
            }
        }
    }

    let encoder = builder.into_inner().map_err(|e| BundleError::io(&out_abs, e))?;
    let sink = encoder.finish().map_err(|e| BundleError::io(&out_abs, e))?;
    let (writer, digest, size) = sink.finish();
    let file = writer
        .into_inner()
        .map_err(|e| BundleError::io(&out_abs, e.into_error()))?;
    file.sync_all().map_err(|e| BundleError::io(&out_abs, e))?;
    drop(file);
    tmp.persist(&out_abs)
        .map_err(|e| BundleError::io(&out_abs, e.error))?;
    fsutil::set_mode(&out_abs, FILE_MODE)?;

    info!(
        output = %out_abs.display(),
        compression = %options.compression,
        digest = %digest,
        files,
        directories,
        excluded,
        "archive exported"
    );
    Ok(ExportReport {
        output: out_abs,
        compression: options.compression,
        digest,
        size,
        files,
        directories,
        excluded,
        skipped_temp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src/pkg")).unwrap();
        fs::create_dir_all(root.join(".strata/ptr/data")).unwrap();
        fs::create_dir_all(root.join("data")).unwrap();
        fs::write(root.join("src/pkg/a.py"), "a = 1\n").unwrap();
        fs::write(root.join("src/b.py"), "b = 2\n").unwrap();
        fs::write(root.join("data/big.bin"), vec![1_u8; 64]).unwrap();
        fs::write(root.join(".strata/ptr/data/big.bin.json"), "{}").unwrap();
        dir
    }

    fn members(archive: &Path) -> Vec<String> {
        let mut out = Vec::new();
        let mut ar = tar::Archive::new(File::open(archive).unwrap());
        for entry in ar.entries().unwrap() {
            let entry = entry.unwrap();
            out.push(String::from_utf8(entry.path_bytes().into_owned()).unwrap());
        }
        out
    }

    #[test]
    fn test_ustar_split() {
        assert!(fits_ustar(&"a".repeat(100)));
        assert!(!fits_ustar(&"a".repeat(101)));
        assert!(fits_ustar(&format!("{}/{}", "d".repeat(150), "f".repeat(100))));
        assert!(!fits_ustar(&format!("{}/{}", "d".repeat(156), "f".repeat(10))));
    }

    #[test]
    fn test_order_and_pointer_exclusion() {
        let src = tree();
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("b.tar");
        let report = export_dir(src.path(), &archive, &ExportOptions::default()).unwrap();
        assert_eq!(report.excluded, 1);
        assert_eq!(
            members(&archive),
            vec![
                ".strata/",
                ".strata/ptr/",
                ".strata/ptr/data/",
                ".strata/ptr/data/big.bin.json",
                "data/",
                "src/",
                "src/b.py",
                "src/pkg/",
                "src/pkg/a.py",
            ]
        );

        let with_data = ExportOptions {
            include_external: true,
            ..Default::default()
        };
        let report = export_dir(src.path(), &archive, &with_data).unwrap();
        assert_eq!(report.excluded, 0);
        assert!(members(&archive).contains(&"data/big.bin".to_string()));
    }

    #[test]
    fn test_output_inside_source_is_skipped() {
        let src = tree();
        let archive = src.path().join("self.tar");
        export_dir(src.path(), &archive, &ExportOptions::default()).unwrap();
        let again = export_dir(src.path(), &archive, &ExportOptions::default()).unwrap();
        assert!(!members(&again.output).contains(&"self.tar".to_string()));
    }

    // Other platforms may fold the two spellings into one file.
    #[cfg(target_os = "linux")]
    #[test]
    fn test_names_colliding_after_nfc_rejected() {
        let src = tree();
        fs::write(src.path().join("src/caf\u{e9}.txt"), "composed\n").unwrap();
        fs::write(src.path().join("src/cafe\u{301}.txt"), "decomposed\n").unwrap();

        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("b.tar");
        let err = export_dir(src.path(), &archive, &ExportOptions::default()).unwrap_err();
        match err {
            BundleError::ArchiveRejected { offenders, total } => {
                assert_eq!(total, 1);
                assert_eq!(
                    offenders,
                    vec!["src/caf\u{e9}.txt: duplicate name after normalization".to_string()]
                );
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!archive.exists());
    }

    #[test]
    fn test_level_validation() {
        let src = tree();
        let out = tempfile::tempdir().unwrap();
        let options = ExportOptions {
            compression: Compression::Gzip,
            level: Some(12),
            ..Default::default()
        };
        let err = export_dir(src.path(), &out.path().join("x.tgz"), &options).unwrap_err();
        assert_eq!(err.kind(), strata_core::ErrorKind::Validation);
        assert_eq!("zst".parse::<Compression>().unwrap(), Compression::Zstd);
    }

    #[test]
    fn test_headers_are_pinned() {
        let src = tree();
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("b.tar");
        export_dir(src.path(), &archive, &ExportOptions::default()).unwrap();

        let mut ar = tar::Archive::new(File::open(&archive).unwrap());
        for entry in ar.entries().unwrap() {
            let entry = entry.unwrap();
            let h = entry.header();
            assert_eq!(h.uid().unwrap(), 0);
            assert_eq!(h.gid().unwrap(), 0);
            assert_eq!(h.mtime().unwrap(), 0);
            assert_eq!(h.username().unwrap(), Some(""));
            let mode = h.mode().unwrap();
            if h.entry_type().is_dir() {
                assert_eq!(mode, 0o755);
            } else {
                assert!(mode == 0o644 || mode == 0o755);
            }
        }
    }
}
