//! Media type strings.

/// Outer envelope understood by any OCI registry.
pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Empty config blob used by artifact-style manifests.
pub const OCI_EMPTY_CONFIG: &str = "application/vnd.oci.empty.v1+json";

/// Bytes of the empty config blob.
pub const OCI_EMPTY_CONFIG_BYTES: &[u8] = b"{}";

/// Digest of [`OCI_EMPTY_CONFIG_BYTES`].
pub const OCI_EMPTY_CONFIG_DIGEST: &str =
    "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a";

/// Artifact type set on the envelope.
pub const BUNDLE_ARTIFACT: &str = "application/vnd.strata.bundle.v1";

/// Top-level bundle manifest document.
pub const BUNDLE_MANIFEST: &str = "application/vnd.strata.bundle.manifest.v1+json";

/// Per-layer index document.
pub const LAYER_INDEX: &str = "application/vnd.strata.layer.index.v1+json";

/// Record describing an externally stored blob.
pub const EXTERNAL_REF: &str = "application/vnd.strata.external.ref.v1+json";

/// Inline file content.
pub const FILE_BLOB: &str = "application/vnd.strata.file.v1";

/// Standard OCI title annotation.
pub const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";

/// Title given to the bundle manifest layer in the envelope.
pub const BUNDLE_MANIFEST_TITLE: &str = "bundle.manifest.json";
