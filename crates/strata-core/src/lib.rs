//! Identity model for strata bundles.
//!
//! This crate is pure: no I/O beyond hashing readers, no network, no clocks
//! except where a caller passes a timestamp in. It provides:
//!
//! - Canonical byte encoding for metadata that feeds a digest
//! - `sha256:<hex>` digests and the layer / manifest identity rules
//! - Bundle references and role selection
//! - Layer indexes, bundle manifests, pointer files and provenance records
//! - Relative-path normalization and the reserved `.strata/` namespace
//!
//! # Identity
//!
//! ```
//! use strata_core::{layer_id, Digest, LayerEntry};
//!
//! let a = LayerEntry::inline("b.txt", 0o644, 1, Digest::of_bytes(b"b"));
//! let b = LayerEntry::inline("a.txt", 0o644, 1, Digest::of_bytes(b"a"));
//! // Entry order never changes a layer id.
//! assert_eq!(
//!     layer_id(&[a.clone(), b.clone()]).unwrap(),
//!     layer_id(&[b, a]).unwrap()
//! );
//! ```

pub mod canonical;
pub mod digest;
pub mod envelope;
pub mod error;
pub mod media;
pub mod model;
pub mod path;
pub mod pointer;
pub mod provenance;
pub mod reference;
pub mod role;
pub mod uri;

pub use canonical::{CanonicalBytes, CanonicalError};
pub use digest::{ContentHasher, Digest};
pub use envelope::{OciDescriptor, OciManifest};
pub use error::{BundleError, BundleResult, ConflictRecord, ErrorKind, FetchFailure};
pub use model::{
    layer_id, manifest_identity, normalize_mode, BundleManifest, BundleMetadata, LayerDescriptor,
    LayerEntry, LayerIndex, ManifestLayer, ResolvedBundle, StorageKind, Tier, EXEC_MODE, FILE_MODE,
};
pub use pointer::{PointerFile, POINTER_SCHEMA_VERSION};
pub use provenance::{Provenance, PROVENANCE_SCHEMA_VERSION};
pub use reference::{BundleRef, Selector};
pub use role::{select_role, SelectedRole, DEFAULT_ROLE};
pub use uri::ExternalUri;
