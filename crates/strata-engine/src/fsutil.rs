//! Filesystem helpers shared by the cache, materializer, exporter and importer.
//!
//! Every write goes through a `.strata-tmp-*` file in the target directory
//! followed by fsync and rename, so readers never observe a torn file.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use strata_core::{BundleError, BundleResult, ContentHasher, Digest};

/// Prefix of every temp file and staging directory the engine creates.
pub const TEMP_PREFIX: &str = ".strata-tmp-";

/// What currently sits at a target path. Symlinks are followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Absent,
    File { hash: Digest, mode: u32 },
    Directory,
    /// Special file or dangling symlink.
    Other,
}

impl NodeState {
    pub fn hash(&self) -> Option<&Digest> {
        match self {
            Self::File { hash, .. } => Some(hash),
            _ => None,
        }
    }
}

pub fn inspect(path: &Path) -> BundleResult<NodeState> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            // A dangling symlink still occupies the name.
            return Ok(match fs::symlink_metadata(path) {
                Ok(_) => NodeState::Other,
                Err(_) => NodeState::Absent,
            });
        }
        Err(e) => return Err(BundleError::io(path, e)),
    };

    if meta.is_dir() {
        return Ok(NodeState::Directory);
    }
    if !meta.is_file() {
        return Ok(NodeState::Other);
    }
    Ok(NodeState::File {
        hash: hash_file(path)?,
        mode: mode_of(&meta),
    })
}

pub fn hash_file(path: &Path) -> BundleResult<Digest> {
    let file = File::open(path).map_err(|e| BundleError::io(path, e))?;
    Digest::of_reader(io::BufReader::new(file)).map_err(|e| BundleError::io(path, e))
}

#[cfg(unix)]
pub fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    strata_core::normalize_mode(meta.permissions().mode())
}

#[cfg(not(unix))]
pub fn mode_of(_meta: &fs::Metadata) -> u32 {
    strata_core::FILE_MODE
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> BundleResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| BundleError::io(path, e))
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> BundleResult<()> {
    Ok(())
}

pub fn create_dir_all(path: &Path) -> BundleResult<()> {
    fs::create_dir_all(path).map_err(|e| BundleError::io(path, e))
}

/// Remove a file, symlink or whole directory tree.
pub fn remove_node(path: &Path) -> BundleResult<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(BundleError::io(path, e)),
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| BundleError::io(path, e))
}

fn parent_of(path: &Path) -> BundleResult<&Path> {
    path.parent().ok_or_else(|| {
        BundleError::io(
            path,
            io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory"),
        )
    })
}

/// Atomically write `bytes` to `path` with `mode`.
pub fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> BundleResult<()> {
    write_atomic_checked(path, bytes, mode, |_| Ok(()))
}

/// Like [`write_atomic`], but `check` sees the bytes read back from the temp
/// file before the rename; an error leaves the target untouched.
pub fn write_atomic_checked(
    path: &Path,
    bytes: &[u8],
    mode: u32,
    check: impl FnOnce(&[u8]) -> BundleResult<()>,
) -> BundleResult<()> {
    let dir = parent_of(path)?;
    create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)
        .map_err(|e| BundleError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| BundleError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| BundleError::io(tmp.path(), e))?;

    let written = fs::read(tmp.path()).map_err(|e| BundleError::io(tmp.path(), e))?;
    check(&written)?;

    set_mode(tmp.path(), mode)?;
    tmp.persist(path).map_err(|e| BundleError::io(path, e.error))?;
    Ok(())
}

/// Stream `src` into a temp file next to `dest`, then rename.
pub fn copy_atomic(src: &Path, dest: &Path, mode: u32) -> BundleResult<()> {
    let dir = parent_of(dest)?;
    create_dir_all(dir)?;

    let mut reader = File::open(src).map_err(|e| BundleError::io(src, e))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)
        .map_err(|e| BundleError::io(dir, e))?;
    io::copy(&mut reader, &mut tmp).map_err(|e| BundleError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| BundleError::io(tmp.path(), e))?;
    set_mode(tmp.path(), mode)?;
    tmp.persist(dest).map_err(|e| BundleError::io(dest, e.error))?;
    Ok(())
}

/// Hardlink `src` under a temp name next to `dest`, then rename over `dest`.
pub fn link_atomic(src: &Path, dest: &Path) -> io::Result<()> {
    let dir = dest
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory"))?;
    fs::create_dir_all(dir)?;
    let tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .make_in(dir, |p| fs::hard_link(src, p))?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

/// Fail when `target` would land outside `root` once symlinks in its
/// existing ancestors are resolved.
pub fn ensure_contained(root: &Path, target: &Path, display: &str) -> BundleResult<()> {
    let mut probe: PathBuf = match target.parent() {
        Some(p) => p.to_path_buf(),
        None => return Ok(()),
    };
    while !probe.exists() {
        match probe.parent() {
            Some(p) => probe = p.to_path_buf(),
            None => return Ok(()),
        }
    }
    let resolved = probe.canonicalize().map_err(|e| BundleError::io(&probe, e))?;
    if resolved.starts_with(root) {
        Ok(())
    } else {
        Err(BundleError::UnsafePath {
            path: display.to_string(),
            reason: format!(
                "resolves outside the destination through {}",
                resolved.display()
            ),
        })
    }
}

/// True when the directory is missing or has no entries.
pub fn is_absent_or_empty(path: &Path) -> BundleResult<bool> {
    match fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(BundleError::io(path, e)),
    }
}

/// Writer that hashes and counts everything passing through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: ContentHasher,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: ContentHasher::new(),
        }
    }

    /// Inner writer, digest and byte count.
    pub fn finish(self) -> (W, Digest, u64) {
        let written = self.hasher.written();
        (self.inner, self.hasher.finish(), written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Run blocking filesystem work off the async executor.
pub async fn blocking<T, F>(f: F) -> BundleResult<T>
where
    F: FnOnce() -> BundleResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        BundleError::io(
            Path::new("<blocking task>"),
            io::Error::other(e.to_string()),
        )
    })?
}
