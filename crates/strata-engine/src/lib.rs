//! Bundle engine: resolve references, materialize bundles into directories,
//! export and import deterministic archives, and author and publish bundles
//! from working directories.
//!
//! # Flow
//!
//! ```text
//! BundleRef ──► BundleResolver ──► Resolution ──► Materializer ──► dest/
//!                    │                                │
//!              BundleRegistry                  ContentProvider ◄── ContentCache
//!
//! dest/ ──► export_dir ──► archive ──► import_archive ──► dest2/
//!
//! strata.yaml ──► BundlePlan ──► Publisher ──► BundleRegistry + ExternalStore
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use strata_engine::{BundleResolver, MaterializeOptions, Materializer};
//! use strata_storage::{InMemoryRegistry, ObjectStoreExternal};
//!
//! # async fn run() -> strata_core::BundleResult<()> {
//! let registry = Arc::new(InMemoryRegistry::new("team/models"));
//! let resolver = BundleResolver::new(registry);
//! let resolution = resolver.resolve_str("team/churn:1.4.0#training").await?;
//!
//! let provider = resolver.provider_for(&resolution, Arc::new(ObjectStoreExternal::new()))?;
//! let report = Materializer::new(provider)
//!     .materialize(&resolution, "./work".as_ref(), &MaterializeOptions::default())
//!     .await?;
//! println!("{} files created", report.counts.created);
//! # Ok(())
//! # }
//! ```

pub mod authoring;
pub mod cache;
pub mod export;
pub mod fsutil;
pub mod import;
pub mod materialize;
pub mod provider;
pub mod resolver;

pub use authoring::{BundlePlan, BundleSpec, PublishOptions, PublishReport, Publisher};
pub use cache::{CacheConfig, ContentCache, LinkMode};
pub use export::{export_dir, Compression, ExportOptions, ExportReport};
pub use import::{import_archive, ArchiveFormat, ImportOptions, ImportReport};
pub use materialize::{
    MaterializeOptions, MaterializeReport, Materializer, Outcome, OutcomeCounts, PathOutcome,
};
pub use provider::{
    ContentProvider, LocalContentProvider, MatEntry, RegistryContentProvider,
    StaticContentProvider,
};
pub use resolver::{BundleResolver, Resolution, ResolveSource, ResolverConfig};
