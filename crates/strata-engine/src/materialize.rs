//! Materialization of a resolved bundle into a destination directory.
//!
//! Entries are applied in path-sorted order. Per entry:
//!
//! | On disk                      | Action                      | Outcome     |
//! |------------------------------|-----------------------------|-------------|
//! | absent                       | atomic write                | `CREATED`   |
//! | same checksum                | none                        | `UNCHANGED` |
//! | differs, `overwrite = false` | recorded, left untouched    | `CONFLICT`  |
//! | differs, `overwrite = true`  | atomic replace              | `REPLACED`  |
//!
//! External entries get a pointer under `.strata/ptr/`. With prefetch the
//! data file is written too and the pointer is marked fulfilled. Conflicts
//! fail the whole call after every entry was visited; nothing already
//! written is rolled back.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use strata_core::path::{join_under, pointer_relpath, provenance_relpath};
use strata_core::{
    select_role, BundleError, BundleResult, ConflictRecord, Digest, FetchFailure, PointerFile,
    Provenance, ResolvedBundle, StorageKind, FILE_MODE, PROVENANCE_SCHEMA_VERSION,
};
use tracing::{debug, info, warn};

use crate::cache::ContentCache;
use crate::fsutil::{self, NodeState};
use crate::provider::{ContentProvider, MatEntry};
use crate::resolver::Resolution;

#[derive(Debug, Clone, Default)]
pub struct MaterializeOptions {
    /// Explicit role; wins over the reference hint.
    pub role: Option<String>,
    pub overwrite: bool,
    pub prefetch_external: bool,
    /// Fixed `createdAt` / `materializedAt`; the current time otherwise.
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Unchanged,
    Created,
    Replaced,
    Conflict,
}

impl Outcome {
    /// Combine the outcomes of a data file and its pointer.
    fn merge(self, other: Self) -> Self {
        self.max(other)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Self::Unchanged => "UNCHANGED",
            Self::Created => "CREATED",
            Self::Replaced => "REPLACED",
            Self::Conflict => "CONFLICT",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathOutcome {
    pub path: String,
    pub outcome: Outcome,
    pub external: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeCounts {
    pub created: usize,
    pub unchanged: usize,
    pub replaced: usize,
    pub conflict: usize,
}

impl OutcomeCounts {
    fn add(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Unchanged => self.unchanged += 1,
            Outcome::Replaced => self.replaced += 1,
            Outcome::Conflict => self.conflict += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializeReport {
    pub manifest_digest: Digest,
    pub role: String,
    pub layers: Vec<String>,
    pub dest: PathBuf,
    pub outcomes: Vec<PathOutcome>,
    pub counts: OutcomeCounts,
    /// Pointer files present after the run.
    pub pointers: usize,
    /// External data files fetched during the run.
    pub prefetched: usize,
}

impl MaterializeReport {
    pub fn outcome_of(&self, path: &str) -> Option<Outcome> {
        self.outcomes.iter().find(|o| o.path == path).map(|o| o.outcome)
    }
}

/// Mutable state of one run.
struct Run<'a> {
    bundle: &'a ResolvedBundle,
    root: PathBuf,
    options: &'a MaterializeOptions,
    timestamp: DateTime<Utc>,
    conflicts: Vec<ConflictRecord>,
    failures: Vec<FetchFailure>,
    prefetched: usize,
}

/// Writes bundles into directories.
pub struct Materializer {
    provider: Arc<dyn ContentProvider>,
    cache: Option<ContentCache>,
}

impl Materializer {
    pub fn new(provider: Arc<dyn ContentProvider>) -> Self {
        Self {
            provider,
            cache: None,
        }
    }

    /// Route inline blobs through `cache`.
    pub fn with_cache(mut self, cache: ContentCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub async fn materialize(
        &self,
        resolution: &Resolution,
        dest: &Path,
        options: &MaterializeOptions,
    ) -> BundleResult<MaterializeReport> {
        let bundle = &resolution.bundle;
        let role = select_role(
            bundle,
            options.role.as_deref(),
            resolution.role_hint.as_deref(),
        )?;
        debug!(role = %role.name, layers = ?role.layers, "role selected");

        let entries = order_entries(self.provider.iter_entries(bundle, &role.layers).await?)?;

        fsutil::create_dir_all(dest)?;
        let root = dest.canonicalize().map_err(|e| BundleError::io(dest, e))?;

        let mut run = Run {
            bundle,
            root,
            options,
            timestamp: options.timestamp.unwrap_or_else(Utc::now),
            conflicts: Vec::new(),
            failures: Vec::new(),
            prefetched: 0,
        };

        let mut outcomes = Vec::with_capacity(entries.len());
        let mut counts = OutcomeCounts::default();
        let mut pointers = 0;
        for entry in &entries {
            let outcome = match entry.entry.kind {
                StorageKind::Inline => self.apply_inline(&mut run, entry).await?,
                StorageKind::External => {
                    let outcome = self.apply_external(&mut run, entry).await?;
                    if outcome != Outcome::Conflict {
                        pointers += 1;
                    }
                    outcome
                }
            };
            debug!(path = %entry.entry.path, outcome = %outcome, "entry applied");
            counts.add(outcome);
            outcomes.push(PathOutcome {
                path: entry.entry.path.clone(),
                outcome,
                external: entry.entry.is_external(),
            });
        }

        if !run.conflicts.is_empty() {
            warn!(conflicts = run.conflicts.len(), dest = %dest.display(), "destination has conflicting content");
            return Err(BundleError::workdir_conflict(run.conflicts));
        }

        let provenance = Provenance {
            schema_version: PROVENANCE_SCHEMA_VERSION,
            name: resolution.metadata.name.clone(),
            version: resolution.metadata.version.clone(),
            manifest_digest: bundle.manifest_digest.clone(),
            role: role.name.clone(),
            layers: role.layers.clone(),
            materialized_at: run.timestamp,
            files: entries
                .iter()
                .filter(|e| !e.entry.is_external())
                .map(|e| (e.entry.path.clone(), e.entry.content_hash.clone()))
                .collect(),
        };
        write_provenance(&run.root, provenance).await?;

        if !run.failures.is_empty() {
            warn!(failures = run.failures.len(), "external prefetch failed");
            return Err(BundleError::prefetch_failed(run.failures));
        }

        info!(
            digest = %bundle.manifest_digest,
            role = %role.name,
            dest = %dest.display(),
            created = counts.created,
            unchanged = counts.unchanged,
            replaced = counts.replaced,
            "bundle materialized"
        );
        Ok(MaterializeReport {
            manifest_digest: bundle.manifest_digest.clone(),
            role: role.name,
            layers: role.layers,
            dest: run.root,
            outcomes,
            counts,
            pointers,
            prefetched: run.prefetched,
        })
    }

    async fn apply_inline(&self, run: &mut Run<'_>, entry: &MatEntry) -> BundleResult<Outcome> {
        let path = &entry.entry.path;
        let expected = &entry.entry.content_hash;
        let target = contained_target(&run.root, path).await?;

        let state = inspect(&target).await?;
        let outcome = match &state {
            // Equivalence is by checksum only; permission bits are left as found.
            NodeState::File { hash, .. } if hash == expected => return Ok(Outcome::Unchanged),
            NodeState::Absent => Outcome::Created,
            _ if !run.options.overwrite => {
                run.conflicts.push(ConflictRecord {
                    path: path.clone(),
                    expected: expected.clone(),
                    actual: state.hash().cloned(),
                });
                return Ok(Outcome::Conflict);
            }
            _ => Outcome::Replaced,
        };

        if matches!(state, NodeState::Directory | NodeState::Other) {
            fsutil::remove_node(&target)?;
        }
        self.write_inline(run.bundle, entry, target).await?;
        Ok(outcome)
    }

    async fn write_inline(
        &self,
        bundle: &ResolvedBundle,
        entry: &MatEntry,
        target: PathBuf,
    ) -> BundleResult<()> {
        let mode = entry.entry.mode;
        match &self.cache {
            Some(cache) => {
                let blob = cache
                    .ensure_blob(
                        &bundle.manifest_digest,
                        &entry.layer_id,
                        &entry.entry.content_hash,
                        || self.provider.fetch_inline(bundle, entry),
                    )
                    .await?;
                let cache = cache.clone();
                fsutil::blocking(move || cache.populate(&blob, &target, mode)).await
            }
            None => {
                let bytes = self.provider.fetch_inline(bundle, entry).await?;
                write_verified(target, bytes, entry.entry.content_hash.clone(), mode).await
            }
        }
    }

    async fn apply_external(&self, run: &mut Run<'_>, entry: &MatEntry) -> BundleResult<Outcome> {
        let path = &entry.entry.path;
        let expected = &entry.entry.content_hash;
        let target = contained_target(&run.root, path).await?;
        let pointer_target = contained_target(&run.root, &pointer_relpath(path)).await?;

        let state = inspect(&target).await?;
        let matching = state.hash() == Some(expected);

        let mut data_outcome = Outcome::Unchanged;
        let mut data_ok = matching;
        if run.options.prefetch_external && !matching {
            if state != NodeState::Absent && !run.options.overwrite {
                run.conflicts.push(ConflictRecord {
                    path: path.clone(),
                    expected: expected.clone(),
                    actual: state.hash().cloned(),
                });
                return Ok(Outcome::Conflict);
            }
            match self.prefetch(entry, &state, target).await {
                Ok(()) => {
                    run.prefetched += 1;
                    data_ok = true;
                    data_outcome = if state == NodeState::Absent {
                        Outcome::Created
                    } else {
                        Outcome::Replaced
                    };
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "external prefetch failed");
                    run.failures.push(FetchFailure {
                        path: path.clone(),
                        uri: entry.entry.uri.clone().unwrap_or_default(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let pointer = PointerFile::for_entry(&entry.entry, &entry.layer, run.timestamp)?;
        let pointer = if data_ok {
            pointer.fulfilled_at(path.clone())
        } else {
            pointer.unfulfilled()
        };
        let pointer_outcome = write_pointer(&pointer_target, &pointer, run.options.overwrite).await?;
        if pointer_outcome == Outcome::Conflict {
            run.conflicts.push(ConflictRecord {
                path: pointer_relpath(path),
                expected: Digest::of_bytes(&pointer.to_bytes()?),
                actual: None,
            });
        }
        Ok(data_outcome.merge(pointer_outcome))
    }

    async fn prefetch(&self, entry: &MatEntry, state: &NodeState, target: PathBuf) -> BundleResult<()> {
        let bytes = self.provider.fetch_external(entry).await?;
        verify(&entry.entry.path, &entry.entry.content_hash, &bytes)?;
        if matches!(state, NodeState::Directory | NodeState::Other) {
            fsutil::remove_node(&target)?;
        }
        write_verified(target, bytes, entry.entry.content_hash.clone(), entry.entry.mode).await
    }
}

/// Validate, sort by path bytes, and merge entries that several layers share.
fn order_entries(mut entries: Vec<MatEntry>) -> BundleResult<Vec<MatEntry>> {
    for entry in &entries {
        entry.entry.validate()?;
    }
    // Stable: among equal paths the earlier layer stays first.
    entries.sort_by(|a, b| a.entry.path.as_bytes().cmp(b.entry.path.as_bytes()));

    let mut out: Vec<MatEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Some(prev) = out.last() {
            if prev.entry.path == entry.entry.path {
                if prev.entry == entry.entry {
                    debug!(path = %entry.entry.path, layer = %entry.layer, "identical entry in several layers");
                    continue;
                }
                return Err(BundleError::validation(format!(
                    "'{}' is provided by layers '{}' and '{}' with different content",
                    entry.entry.path, prev.layer, entry.layer
                )));
            }
        }
        out.push(entry);
    }

    let files: BTreeSet<&str> = out.iter().map(|e| e.entry.path.as_str()).collect();
    for path in &files {
        let mut ancestor = *path;
        while let Some((parent, _)) = ancestor.rsplit_once('/') {
            if files.contains(parent) {
                return Err(BundleError::validation(format!(
                    "'{}' is both a file and the parent directory of '{}'",
                    parent, path
                )));
            }
            ancestor = parent;
        }
    }
    Ok(out)
}

fn verify(path: &str, expected: &Digest, bytes: &[u8]) -> BundleResult<()> {
    let actual = Digest::of_bytes(bytes);
    if &actual != expected {
        return Err(BundleError::DigestMismatch {
            subject: path.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

async fn contained_target(root: &Path, rel: &str) -> BundleResult<PathBuf> {
    let target = join_under(root, rel)?;
    let (root, probe, display) = (root.to_path_buf(), target.clone(), rel.to_string());
    fsutil::blocking(move || fsutil::ensure_contained(&root, &probe, &display)).await?;
    Ok(target)
}

async fn inspect(path: &Path) -> BundleResult<NodeState> {
    let path = path.to_path_buf();
    fsutil::blocking(move || fsutil::inspect(&path)).await
}

async fn write_verified(target: PathBuf, bytes: Bytes, expected: Digest, mode: u32) -> BundleResult<()> {
    fsutil::blocking(move || {
        let subject = target.display().to_string();
        fsutil::write_atomic_checked(&target, &bytes, mode, |written| {
            verify(&subject, &expected, written)
        })
    })
    .await
}

/// Write `pointer` unless an equal one (ignoring `createdAt`) is in place.
async fn write_pointer(target: &Path, pointer: &PointerFile, overwrite: bool) -> BundleResult<Outcome> {
    let path = target.to_path_buf();
    let existing = fsutil::blocking(move || match fsutil::inspect(&path)? {
        NodeState::Absent => Ok(None),
        NodeState::File { .. } => {
            let bytes = std::fs::read(&path).map_err(|e| BundleError::io(&path, e))?;
            Ok(Some(PointerFile::from_bytes(&bytes).ok()))
        }
        NodeState::Directory | NodeState::Other => Ok(Some(None)),
    })
    .await?;

    let outcome = match &existing {
        None => Outcome::Created,
        Some(Some(current)) if current.same_content(pointer) => return Ok(Outcome::Unchanged),
        Some(Some(_)) => Outcome::Replaced,
        Some(None) if target.is_dir() && !overwrite => return Ok(Outcome::Conflict),
        Some(None) => Outcome::Replaced,
    };

    if target.is_dir() {
        fsutil::remove_node(target)?;
    }
    let bytes = pointer.to_bytes()?;
    let path = target.to_path_buf();
    fsutil::blocking(move || {
        fsutil::write_atomic_checked(&path, &bytes, FILE_MODE, |written| {
            PointerFile::from_bytes(written).map(|_| ())
        })
    })
    .await?;
    Ok(outcome)
}

/// Write the provenance record, keeping an existing one that differs only
/// in `materializedAt`.
async fn write_provenance(root: &Path, record: Provenance) -> BundleResult<()> {
    let target = join_under(root, &provenance_relpath())?;
    fsutil::blocking(move || {
        if let NodeState::File { .. } = fsutil::inspect(&target)? {
            let bytes = std::fs::read(&target).map_err(|e| BundleError::io(&target, e))?;
            if let Ok(current) = Provenance::from_bytes(&bytes) {
                let comparable = Provenance {
                    materialized_at: current.materialized_at,
                    ..record.clone()
                };
                if current == comparable {
                    return Ok(());
                }
            }
        }
        let bytes = record.to_bytes()?;
        fsutil::write_atomic_checked(&target, &bytes, FILE_MODE, |written| {
            Provenance::from_bytes(written).map(|_| ())
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StaticContentProvider;
    use chrono::TimeZone;
    use std::fs;
    use strata_core::ErrorKind;

    const DATA_URI: &str = "memory://datasets/churn/features.parquet";

    fn provider() -> StaticContentProvider {
        StaticContentProvider::new()
            .with_inline("code", "src/main.py", b"print('main')\n", 0o644)
            .with_inline("code", "bin/run.sh", b"#!/bin/sh\n", 0o755)
            .with_inline("config", "conf/app.yaml", b"workers: 4\n", 0o644)
            .with_external("data", "data/features.parquet", DATA_URI, b"PAR1-features")
    }

    fn resolution(provider: &StaticContentProvider) -> Resolution {
        let bundle = provider
            .bundle(&[
                ("default", &["code", "config"]),
                ("training", &["code", "data"]),
            ])
            .unwrap();
        Resolution::provided(bundle)
    }

    fn fixed() -> MaterializeOptions {
        MaterializeOptions {
            timestamp: Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fresh_then_idempotent() {
        let provider = provider();
        let res = resolution(&provider);
        let dest = tempfile::tempdir().unwrap();
        let m = Materializer::new(Arc::new(provider.clone()));

        let first = m.materialize(&res, dest.path(), &fixed()).await.unwrap();
        assert_eq!(first.role, "default");
        assert_eq!(first.counts.created, 3);
        assert_eq!(
            fs::read(dest.path().join("conf/app.yaml")).unwrap(),
            b"workers: 4\n"
        );
        let provenance = fs::read(dest.path().join(".strata/provenance.json")).unwrap();

        let second = m.materialize(&res, dest.path(), &MaterializeOptions::default()).await.unwrap();
        assert_eq!(second.counts.unchanged, 3);
        assert_eq!(second.counts.created, 0);
        // Only materializedAt would differ, so the record is left alone.
        assert_eq!(
            fs::read(dest.path().join(".strata/provenance.json")).unwrap(),
            provenance
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_mode_applied() {
        use std::os::unix::fs::PermissionsExt;
        let provider = provider();
        let dest = tempfile::tempdir().unwrap();
        Materializer::new(Arc::new(provider.clone()))
            .materialize(&resolution(&provider), dest.path(), &fixed())
            .await
            .unwrap();
        let mode = fs::metadata(dest.path().join("bin/run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_matching_content_keeps_its_mode() {
        use std::os::unix::fs::PermissionsExt;
        let provider = provider();
        let dest = tempfile::tempdir().unwrap();
        let script = dest.path().join("src/main.py");
        fs::create_dir_all(script.parent().unwrap()).unwrap();
        fs::write(&script, "print('main')\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let report = Materializer::new(Arc::new(provider.clone()))
            .materialize(&resolution(&provider), dest.path(), &fixed())
            .await
            .unwrap();
        let outcome = report.outcomes.iter().find(|o| o.path == "src/main.py").unwrap();
        assert_eq!(outcome.outcome, Outcome::Unchanged);
        assert_eq!(fs::metadata(&script).unwrap().permissions().mode() & 0o777, 0o755);
    }

    #[tokio::test]
    async fn test_conflict_leaves_file_and_reports() {
        let provider = provider();
        let res = resolution(&provider);
        let dest = tempfile::tempdir().unwrap();
        fs::create_dir_all(dest.path().join("src")).unwrap();
        fs::write(dest.path().join("src/main.py"), "local edit\n").unwrap();

        let m = Materializer::new(Arc::new(provider.clone()));
        let err = m.materialize(&res, dest.path(), &fixed()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WorkdirConflict);
        match &err {
            BundleError::WorkdirConflict { conflicts, total } => {
                assert_eq!(*total, 1);
                assert_eq!(conflicts[0].path, "src/main.py");
                assert_eq!(
                    conflicts[0].actual,
                    Some(Digest::of_bytes(b"local edit\n"))
                );
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(
            fs::read_to_string(dest.path().join("src/main.py")).unwrap(),
            "local edit\n"
        );
        // Non-conflicting entries were still written.
        assert!(dest.path().join("conf/app.yaml").is_file());

        let options = MaterializeOptions {
            overwrite: true,
            ..fixed()
        };
        let report = m.materialize(&res, dest.path(), &options).await.unwrap();
        assert_eq!(report.outcome_of("src/main.py"), Some(Outcome::Replaced));
    }

    #[tokio::test]
    async fn test_directory_in_place_of_file() {
        let provider = provider();
        let res = resolution(&provider);
        let dest = tempfile::tempdir().unwrap();
        fs::create_dir_all(dest.path().join("conf/app.yaml/inner")).unwrap();

        let m = Materializer::new(Arc::new(provider.clone()));
        let err = m.materialize(&res, dest.path(), &fixed()).await.unwrap_err();
        match err {
            BundleError::WorkdirConflict { conflicts, .. } => assert_eq!(conflicts[0].actual, None),
            other => panic!("unexpected error {other:?}"),
        }

        let options = MaterializeOptions {
            overwrite: true,
            ..fixed()
        };
        m.materialize(&res, dest.path(), &options).await.unwrap();
        assert!(dest.path().join("conf/app.yaml").is_file());
    }

    #[tokio::test]
    async fn test_pointer_without_prefetch() {
        let provider = provider();
        let res = resolution(&provider);
        let dest = tempfile::tempdir().unwrap();
        let options = MaterializeOptions {
            role: Some("training".to_string()),
            ..fixed()
        };

        let report = Materializer::new(Arc::new(provider.clone()))
            .materialize(&res, dest.path(), &options)
            .await
            .unwrap();
        assert_eq!(report.pointers, 1);
        assert_eq!(provider.external_fetches(), 0);
        assert!(!dest.path().join("data/features.parquet").exists());

        let bytes = fs::read(dest.path().join(".strata/ptr/data/features.parquet.json")).unwrap();
        let pointer = PointerFile::from_bytes(&bytes).unwrap();
        assert!(!pointer.fulfilled);
        assert_eq!(pointer.uri, DATA_URI);
        assert_eq!(pointer.content_hash, Digest::of_bytes(b"PAR1-features"));
        assert_eq!(pointer.layer, "data");
    }

    #[tokio::test]
    async fn test_prefetch_fulfills_pointer() {
        let provider = provider();
        let res = resolution(&provider);
        let dest = tempfile::tempdir().unwrap();
        let options = MaterializeOptions {
            role: Some("training".to_string()),
            prefetch_external: true,
            ..fixed()
        };

        let report = Materializer::new(Arc::new(provider.clone()))
            .materialize(&res, dest.path(), &options)
            .await
            .unwrap();
        assert_eq!(report.prefetched, 1);
        assert_eq!(
            fs::read(dest.path().join("data/features.parquet")).unwrap(),
            b"PAR1-features"
        );
        let bytes = fs::read(dest.path().join(".strata/ptr/data/features.parquet.json")).unwrap();
        let pointer = PointerFile::from_bytes(&bytes).unwrap();
        assert!(pointer.fulfilled);
        assert_eq!(pointer.local_path.as_deref(), Some("data/features.parquet"));
    }

    #[tokio::test]
    async fn test_prefetch_failure_then_recovery() {
        let provider = provider();
        let res = resolution(&provider);
        let dest = tempfile::tempdir().unwrap();
        let options = MaterializeOptions {
            role: Some("training".to_string()),
            prefetch_external: true,
            ..fixed()
        };
        let m = Materializer::new(Arc::new(provider.clone()));
        let pointer_path = dest.path().join(".strata/ptr/data/features.parquet.json");

        provider.fail_uri(DATA_URI);
        let err = m.materialize(&res, dest.path(), &options).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("data/features.parquet"));
        let pointer = PointerFile::from_bytes(&fs::read(&pointer_path).unwrap()).unwrap();
        assert!(!pointer.fulfilled);
        // Inline files and provenance are in place despite the failure.
        assert!(dest.path().join(".strata/provenance.json").is_file());

        provider.heal_uri(DATA_URI);
        m.materialize(&res, dest.path(), &options).await.unwrap();
        let pointer = PointerFile::from_bytes(&fs::read(&pointer_path).unwrap()).unwrap();
        assert!(pointer.fulfilled);
    }

    #[tokio::test]
    async fn test_corrupt_external_bytes_not_written() {
        let provider = provider();
        let res = resolution(&provider);
        let dest = tempfile::tempdir().unwrap();
        provider.set_external(DATA_URI, b"tampered");

        let options = MaterializeOptions {
            role: Some("training".to_string()),
            prefetch_external: true,
            ..fixed()
        };
        let err = Materializer::new(Arc::new(provider.clone()))
            .materialize(&res, dest.path(), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::PrefetchFailed { .. }));
        assert!(!dest.path().join("data/features.parquet").exists());
    }

    #[tokio::test]
    async fn test_fulfilled_pointer_with_missing_data_is_downgraded() {
        let provider = provider();
        let res = resolution(&provider);
        let dest = tempfile::tempdir().unwrap();
        let m = Materializer::new(Arc::new(provider.clone()));
        let prefetch = MaterializeOptions {
            role: Some("training".to_string()),
            prefetch_external: true,
            ..fixed()
        };
        m.materialize(&res, dest.path(), &prefetch).await.unwrap();
        fs::remove_file(dest.path().join("data/features.parquet")).unwrap();

        let lazy = MaterializeOptions {
            prefetch_external: false,
            ..prefetch
        };
        let report = m.materialize(&res, dest.path(), &lazy).await.unwrap();
        assert_eq!(report.outcome_of("data/features.parquet"), Some(Outcome::Replaced));
        let bytes = fs::read(dest.path().join(".strata/ptr/data/features.parquet.json")).unwrap();
        assert!(!PointerFile::from_bytes(&bytes).unwrap().fulfilled);
    }

    #[tokio::test]
    async fn test_role_hint_and_explicit_precedence() {
        let provider = provider();
        let res = resolution(&provider).with_role_hint("training");
        let dest = tempfile::tempdir().unwrap();
        let m = Materializer::new(Arc::new(provider.clone()));

        let hinted = m.materialize(&res, dest.path(), &fixed()).await.unwrap();
        assert_eq!(hinted.role, "training");

        let explicit = MaterializeOptions {
            role: Some("default".to_string()),
            ..fixed()
        };
        let other = tempfile::tempdir().unwrap();
        let report = m.materialize(&res, other.path(), &explicit).await.unwrap();
        assert_eq!(report.role, "default");
    }

    #[tokio::test]
    async fn test_unknown_role_writes_nothing() {
        let provider = provider();
        let res = resolution(&provider);
        let dest = tempfile::tempdir().unwrap();
        let options = MaterializeOptions {
            role: Some("serving".to_string()),
            ..fixed()
        };
        let err = Materializer::new(Arc::new(provider.clone()))
            .materialize(&res, dest.path(), &options)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RoleLayerMismatch);
        assert!(err.to_string().contains("training"));
        assert!(fsutil::is_absent_or_empty(dest.path()).unwrap());
    }

    #[tokio::test]
    async fn test_shared_path_across_layers() {
        let same = StaticContentProvider::new()
            .with_inline("a", "LICENSE", b"MIT", 0o644)
            .with_inline("b", "LICENSE", b"MIT", 0o644);
        let bundle = same.bundle(&[("default", &["a", "b"])]).unwrap();
        let dest = tempfile::tempdir().unwrap();
        let report = Materializer::new(Arc::new(same))
            .materialize(&Resolution::provided(bundle), dest.path(), &fixed())
            .await
            .unwrap();
        assert_eq!(report.outcomes.len(), 1);

        let clash = StaticContentProvider::new()
            .with_inline("a", "LICENSE", b"MIT", 0o644)
            .with_inline("b", "LICENSE", b"BSD", 0o644);
        let bundle = clash.bundle(&[("default", &["a", "b"])]).unwrap();
        let err = Materializer::new(Arc::new(clash))
            .materialize(&Resolution::provided(bundle), dest.path(), &fixed())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_parent_outside_dest_rejected() {
        let provider = provider();
        let res = resolution(&provider);
        let dest = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dest.path().join("conf")).unwrap();

        let err = Materializer::new(Arc::new(provider.clone()))
            .materialize(&res, dest.path(), &fixed())
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::UnsafePath { .. }));
        assert!(!outside.path().join("app.yaml").exists());
    }

    #[tokio::test]
    async fn test_cache_fetches_each_blob_once() {
        let provider = provider();
        let res = resolution(&provider);
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::new(crate::cache::CacheConfig::new(cache_dir.path()));
        let m = Materializer::new(Arc::new(provider.clone())).with_cache(cache);

        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        m.materialize(&res, a.path(), &fixed()).await.unwrap();
        m.materialize(&res, b.path(), &fixed()).await.unwrap();
        assert_eq!(provider.inline_fetches(), 3);
        assert_eq!(
            fs::read(a.path().join("src/main.py")).unwrap(),
            fs::read(b.path().join("src/main.py")).unwrap()
        );
    }

    #[tokio::test]
    async fn test_fixed_timestamp_is_byte_identical() {
        let provider = provider();
        let res = resolution(&provider);
        let options = MaterializeOptions {
            role: Some("training".to_string()),
            ..fixed()
        };
        let m = Materializer::new(Arc::new(provider.clone()));
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        m.materialize(&res, a.path(), &options).await.unwrap();
        m.materialize(&res, b.path(), &options).await.unwrap();

        for rel in [
            ".strata/provenance.json",
            ".strata/ptr/data/features.parquet.json",
        ] {
            assert_eq!(
                fs::read(a.path().join(rel)).unwrap(),
                fs::read(b.path().join(rel)).unwrap(),
                "{rel}"
            );
        }
    }
}
