//! Authoring: turn a working directory into a publishable bundle.
//!
//! `strata.yaml` → [`scan_dir`] → [`BundlePlan`] → [`Publisher`].

pub mod plan;
pub mod publish;
pub mod scan;
pub mod spec;

pub use plan::{assign_layers, decide, BundlePlan, LayerPlan, PlanSummary, PlannedFile};
pub use publish::{PublishOptions, PublishReport, Publisher};
pub use scan::{scan_dir, ScannedFile};
pub use spec::{
    BundleSpec, ExternalRule, LayerMatcher, LayerSpec, RuleMatcher, SpecBody, SpecMetadata,
    API_VERSION, DEFAULT_INLINE_SIZE_LIMIT, KIND, SPEC_FILE_NAMES,
};
