//! The `strata.yaml` bundle spec a working directory is authored with.
//!
//! ```yaml
//! apiVersion: strata/v1
//! kind: Bundle
//! metadata:
//!   name: team/churn
//!   version: 1.4.0
//! spec:
//!   layers:
//!     - name: code
//!       files: ["src/**"]
//!       ignore: ["**/__pycache__/**"]
//!     - name: data
//!       files: ["data/**"]
//!   roles:
//!     default: [code]
//!     training: [code, data]
//!   externalRules:
//!     - pattern: "data/*.parquet"
//!       uriTemplate: "s3://team-datasets/churn/{path}"
//!       tier: cool
//!       sizeThreshold: 1048576
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use globset::{Glob, GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use strata_core::model::validate_roles;
use strata_core::reference::{validate_bundle_name, validate_role_name, validate_version};
use strata_core::{BundleError, BundleResult, Tier};

/// File names searched, in order, in a working directory.
pub const SPEC_FILE_NAMES: &[&str] = &["strata.yaml", "strata.yml"];

pub const API_VERSION: &str = "strata/v1";

pub const KIND: &str = "Bundle";

/// Largest file that may be stored inline when no external rule matches.
pub const DEFAULT_INLINE_SIZE_LIMIT: u64 = 100_000_000;

/// Placeholder substituted with the bundle path in `uriTemplate`.
pub const PATH_PLACEHOLDER: &str = "{path}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BundleSpec {
    pub api_version: String,
    pub kind: String,
    pub metadata: SpecMetadata,
    pub spec: SpecBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SpecMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Copied onto the registry envelope; never part of the identity.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SpecBody {
    pub layers: Vec<LayerSpec>,
    #[serde(default)]
    pub roles: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub external_rules: Vec<ExternalRule>,
    #[serde(default = "default_inline_size_limit")]
    pub inline_size_limit: u64,
}

fn default_inline_size_limit() -> u64 {
    DEFAULT_INLINE_SIZE_LIMIT
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LayerSpec {
    pub name: String,
    /// Include globs; `*` stays within one directory, `**` crosses them.
    pub files: Vec<String>,
    /// Exclude globs; `*` also matches `/`.
    #[serde(default)]
    pub ignore: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExternalRule {
    /// Matched against the bundle path; `*` also matches `/`.
    pub pattern: String,
    pub uri_template: String,
    #[serde(default)]
    pub tier: Tier,
    /// Only files at least this large match.
    #[serde(default)]
    pub size_threshold: Option<u64>,
}

impl ExternalRule {
    pub fn uri_for(&self, path: &str) -> String {
        self.uri_template.replace(PATH_PLACEHOLDER, path)
    }
}

fn glob(pattern: &str, literal_separator: bool) -> BundleResult<GlobMatcher> {
    let built: Result<Glob, _> = GlobBuilder::new(pattern)
        .literal_separator(literal_separator)
        .build();
    built
        .map(|g| g.compile_matcher())
        .map_err(|e| BundleError::validation(format!("invalid glob '{}': {}", pattern, e)))
}

/// Compiled include/ignore globs for one layer.
#[derive(Debug, Clone)]
pub struct LayerMatcher {
    pub name: String,
    include: Vec<GlobMatcher>,
    ignore: Vec<GlobMatcher>,
}

impl LayerMatcher {
    pub fn new(layer: &LayerSpec) -> BundleResult<Self> {
        Ok(Self {
            name: layer.name.clone(),
            include: layer
                .files
                .iter()
                .map(|p| glob(p.trim_start_matches("./"), true))
                .collect::<BundleResult<_>>()?,
            ignore: layer
                .ignore
                .iter()
                .map(|p| glob(p.trim_start_matches("./"), false))
                .collect::<BundleResult<_>>()?,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.include.iter().any(|g| g.is_match(path)) && !self.ignore.iter().any(|g| g.is_match(path))
    }
}

/// A compiled external rule.
#[derive(Debug, Clone)]
pub struct RuleMatcher {
    pub rule: ExternalRule,
    pattern: GlobMatcher,
}

impl RuleMatcher {
    pub fn new(rule: &ExternalRule) -> BundleResult<Self> {
        Ok(Self {
            rule: rule.clone(),
            pattern: glob(&rule.pattern, false)?,
        })
    }

    pub fn matches(&self, path: &str, size: u64) -> bool {
        self.pattern.is_match(path) && self.rule.size_threshold.is_none_or(|min| size >= min)
    }
}

impl BundleSpec {
    pub fn from_yaml(text: &str) -> BundleResult<Self> {
        let spec: Self = serde_yaml::from_str(text)
            .map_err(|e| BundleError::validation(format!("malformed bundle spec: {}", e)))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Locate the spec file in `dir`.
    pub fn find(dir: &Path) -> BundleResult<PathBuf> {
        SPEC_FILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                BundleError::not_found(format!(
                    "bundle spec ({}) in {}",
                    SPEC_FILE_NAMES.join(" or "),
                    dir.display()
                ))
            })
    }

    /// Find, read and validate the spec in `dir`.
    pub fn load(dir: &Path) -> BundleResult<Self> {
        let path = Self::find(dir)?;
        let text = std::fs::read_to_string(&path).map_err(|e| BundleError::io(&path, e))?;
        Self::from_yaml(&text).map_err(|e| match e {
            BundleError::Validation { message } => {
                BundleError::validation(format!("{}: {}", path.display(), message))
            }
            other => other,
        })
    }

    pub fn validate(&self) -> BundleResult<()> {
        if self.api_version != API_VERSION {
            return Err(BundleError::validation(format!(
                "apiVersion '{}' is not supported (expected '{}')",
                self.api_version, API_VERSION
            )));
        }
        if self.kind != KIND {
            return Err(BundleError::validation(format!(
                "kind '{}' is not supported (expected '{}')",
                self.kind, KIND
            )));
        }
        validate_bundle_name(&self.metadata.name).map_err(BundleError::validation)?;
        validate_version(&self.metadata.version).map_err(BundleError::validation)?;

        if self.spec.layers.is_empty() {
            return Err(BundleError::validation("bundle spec declares no layers"));
        }
        let mut names = BTreeSet::new();
        for layer in &self.spec.layers {
            validate_role_name(&layer.name).map_err(|reason| {
                BundleError::validation(format!("invalid layer name '{}': {}", layer.name, reason))
            })?;
            if !names.insert(layer.name.as_str()) {
                return Err(BundleError::validation(format!(
                    "layer '{}' declared more than once",
                    layer.name
                )));
            }
            if layer.files.is_empty() {
                return Err(BundleError::validation(format!(
                    "layer '{}' has no file patterns",
                    layer.name
                )));
            }
            LayerMatcher::new(layer)?;
        }
        validate_roles(&self.spec.roles, &names)?;

        for rule in &self.spec.external_rules {
            RuleMatcher::new(rule)?;
            if !rule.uri_template.contains(PATH_PLACEHOLDER) {
                return Err(BundleError::validation(format!(
                    "external rule '{}' has uriTemplate '{}' without {}",
                    rule.pattern, rule.uri_template, PATH_PLACEHOLDER
                )));
            }
        }
        Ok(())
    }

    pub fn layer_matchers(&self) -> BundleResult<Vec<LayerMatcher>> {
        self.spec.layers.iter().map(LayerMatcher::new).collect()
    }

    pub fn rule_matchers(&self) -> BundleResult<Vec<RuleMatcher>> {
        self.spec.external_rules.iter().map(RuleMatcher::new).collect()
    }
}
