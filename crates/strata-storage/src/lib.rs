//! Storage collaborators for strata bundles.
//!
//! - [`BundleRegistry`]: content-addressable registry bound to one repository
//!   ([`OciRegistryClient`] over the OCI distribution API, [`InMemoryRegistry`])
//! - [`ExternalStore`]: object storage for large blobs
//!   ([`ObjectStoreExternal`] over `object_store`)
//!
//! The engine never talks to reqwest or object_store directly; it only sees
//! these traits.
//!
//! # Quick Start
//!
//! ```no_run
//! use strata_storage::{BundleRegistry, OciRegistryClient, RegistryConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RegistryConfig::new("registry.example.io", "team/models").with_token("t0k3n");
//! let registry = OciRegistryClient::new(config)?;
//! if let Some(head) = registry.head_manifest("team.churn--1.4.0").await? {
//!     println!("{} ({} bytes)", head.digest, head.size);
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod external;
pub mod registry;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use external::{ExternalRecord, ExternalStore, ObjectStoreExternal};
pub use registry::oci::{Credentials, REGISTRY_USER_AGENT};
pub use registry::{BundleRegistry, InMemoryRegistry, OciRegistryClient};
pub use types::{ExternalStat, ManifestHead, ManifestResponse, RegistryConfig};
