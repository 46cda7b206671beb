//! Relative path normalization and the reserved `.strata/` namespace.

use std::path::{Path, PathBuf};

use unicode_normalization::UnicodeNormalization;

use crate::error::{BundleError, BundleResult};

/// Reserved directory inside every materialized tree.
pub const RESERVED_DIR: &str = ".strata";

/// Pointer files live under `.strata/ptr/`.
pub const POINTER_DIR: &str = "ptr";

/// Suffix appended to the original filename of a pointer.
pub const POINTER_SUFFIX: &str = ".json";

/// Provenance record written by the materializer.
pub const PROVENANCE_FILE: &str = "provenance.json";

fn unsafe_path(path: &str, reason: &str) -> BundleError {
    BundleError::UnsafePath {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

/// Normalize a relative path: NFC, forward slashes, no `.` segments.
///
/// Rejects empty, absolute, drive-letter, backslash, NUL, and `..` paths.
pub fn normalize_relpath(raw: &str) -> BundleResult<String> {
    if raw.is_empty() {
        return Err(unsafe_path(raw, "empty path"));
    }
    if raw.contains('\0') {
        return Err(unsafe_path(raw, "contains NUL"));
    }
    if raw.contains('\\') {
        return Err(unsafe_path(raw, "contains a backslash"));
    }
    if raw.starts_with('/') {
        return Err(unsafe_path(raw, "absolute path"));
    }
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(unsafe_path(raw, "drive-qualified path"));
    }

    let normalized: String = raw.nfc().collect();
    let mut segments = Vec::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(unsafe_path(raw, "contains '..'")),
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(unsafe_path(raw, "no path segments"));
    }
    Ok(segments.join("/"))
}

/// Normalize a bundle content path and refuse the reserved namespace.
pub fn safe_relpath(raw: &str) -> BundleResult<String> {
    let path = normalize_relpath(raw)?;
    if is_reserved(&path) {
        return Err(unsafe_path(raw, "inside the reserved .strata/ directory"));
    }
    Ok(path)
}

/// Whether a normalized path lives inside `.strata/`.
pub fn is_reserved(path: &str) -> bool {
    path == RESERVED_DIR || path.starts_with(&format!("{}/", RESERVED_DIR))
}

/// Pointer location for a content path: `.strata/ptr/<dir>/<name>.json`.
pub fn pointer_relpath(original: &str) -> String {
    format!(
        "{}/{}/{}{}",
        RESERVED_DIR, POINTER_DIR, original, POINTER_SUFFIX
    )
}

/// Inverse of [`pointer_relpath`]; `None` for anything else.
pub fn original_from_pointer(pointer: &str) -> Option<String> {
    let prefix = format!("{}/{}/", RESERVED_DIR, POINTER_DIR);
    pointer
        .strip_prefix(&prefix)?
        .strip_suffix(POINTER_SUFFIX)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Relative path of the provenance record.
pub fn provenance_relpath() -> String {
    format!("{}/{}", RESERVED_DIR, PROVENANCE_FILE)
}

/// Join a normalized relative path under `root`.
pub fn join_under(root: &Path, rel: &str) -> BundleResult<PathBuf> {
    let rel = normalize_relpath(rel)?;
    let mut out = root.to_path_buf();
    for segment in rel.split('/') {
        out.push(segment);
    }
    Ok(out)
}

/// Render a filesystem path relative to `root` in bundle form.
pub fn relpath_of(root: &Path, path: &Path) -> BundleResult<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        unsafe_path(
            &path.display().to_string(),
            "outside of the directory being processed",
        )
    })?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            std::path::Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    unsafe_path(&path.display().to_string(), "name is not valid UTF-8")
                })?;
                parts.push(part.to_string());
            }
            std::path::Component::CurDir => {}
            _ => {
                return Err(unsafe_path(
                    &path.display().to_string(),
                    "unexpected path component",
                ))
            }
        }
    }
    normalize_relpath(&parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_dots_and_slashes() {
        assert_eq!(normalize_relpath("./src//model.py").unwrap(), "src/model.py");
        assert_eq!(normalize_relpath("a/./b/").unwrap(), "a/b");
    }

    #[test]
    fn test_rejects_escapes() {
        for bad in ["", "/etc/passwd", "../x", "a/../../b", "a\\b", "C:/x", "a\0b", "./"] {
            assert!(normalize_relpath(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_nfc_normalization() {
        // "e" + combining acute accent becomes the precomposed U+00E9.
        let decomposed = "data/cafe\u{0301}.csv";
        assert_eq!(normalize_relpath(decomposed).unwrap(), "data/caf\u{e9}.csv");
    }

    #[test]
    fn test_reserved_namespace() {
        assert!(safe_relpath(".strata/ptr/x.json").is_err());
        assert!(safe_relpath(".strata").is_err());
        assert!(safe_relpath(".strataish/file").is_ok());
        assert!(normalize_relpath(".strata/provenance.json").is_ok());
    }

    #[test]
    fn test_pointer_paths() {
        let p = pointer_relpath("data/train/part-0.csv");
        assert_eq!(p, ".strata/ptr/data/train/part-0.csv.json");
        assert_eq!(
            original_from_pointer(&p).as_deref(),
            Some("data/train/part-0.csv")
        );
        assert_eq!(original_from_pointer(".strata/provenance.json"), None);
    }

    #[test]
    fn test_join_and_relpath() {
        let root = Path::new("/tmp/dest");
        let joined = join_under(root, "a/b.txt").unwrap();
        assert_eq!(joined, Path::new("/tmp/dest/a/b.txt"));
        assert_eq!(relpath_of(root, &joined).unwrap(), "a/b.txt");
        assert!(join_under(root, "../b").is_err());
    }
}
