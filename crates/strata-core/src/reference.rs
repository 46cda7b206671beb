//! Bundle references.
//!
//! A reference names a bundle in exactly one way:
//! - `./bundle-dir` or `/abs/dir` → local working directory
//! - `sha256:<hex>` → exact digest
//! - `team/model:1.4.0` → name and version
//!
//! Any form may carry a role hint as a `#role` suffix (`team/model:1.4.0#training`).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{BundleError, BundleResult};

/// Longest tag an OCI registry accepts.
pub const MAX_TAG_LEN: usize = 128;

/// Separator between encoded name and version in a registry tag.
const TAG_SEPARATOR: &str = "--";

/// A bundle reference as supplied by a caller.
///
/// The struct can hold any combination of selectors; [`BundleRef::selector`]
/// enforces that exactly one group is populated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Role hint; an explicit role argument takes precedence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// The validated selector of a [`BundleRef`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector<'a> {
    LocalPath(&'a Path),
    Digest(Digest),
    NameVersion { name: &'a str, version: &'a str },
}

impl BundleRef {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn digest(digest: impl Into<String>) -> Self {
        Self {
            digest: Some(digest.into()),
            ..Self::default()
        }
    }

    pub fn named(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            version: Some(version.into()),
            ..Self::default()
        }
    }

    /// Attach a role hint.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Validate selector exclusivity and the populated selector's format.
    pub fn selector(&self) -> BundleResult<Selector<'_>> {
        let has_name_group = self.name.is_some() || self.version.is_some();
        let populated = [
            self.local_path.is_some(),
            self.digest.is_some(),
            has_name_group,
        ]
        .iter()
        .filter(|set| **set)
        .count();

        if populated != 1 {
            return Err(self.invalid(if populated == 0 {
                "one of local path, digest, or name+version is required"
            } else {
                "local path, digest, and name+version are mutually exclusive"
            }));
        }

        if let Some(role) = &self.role {
            validate_role_name(role).map_err(|reason| self.invalid(&reason))?;
        }

        if let Some(path) = &self.local_path {
            if path.as_os_str().is_empty() {
                return Err(self.invalid("local path is empty"));
            }
            return Ok(Selector::LocalPath(path));
        }

        if let Some(digest) = &self.digest {
            let digest = Digest::parse(digest).map_err(|e| self.invalid(&e.to_string()))?;
            return Ok(Selector::Digest(digest));
        }

        let (name, version) = match (&self.name, &self.version) {
            (Some(name), Some(version)) => (name.as_str(), version.as_str()),
            (Some(_), None) => return Err(self.invalid("name requires a version")),
            _ => return Err(self.invalid("version requires a name")),
        };
        validate_bundle_name(name).map_err(|reason| self.invalid(&reason))?;
        validate_version(version).map_err(|reason| self.invalid(&reason))?;
        let tag = version_tag(name, version);
        if tag.len() > MAX_TAG_LEN {
            return Err(self.invalid(&format!(
                "name and version encode to a {}-character tag (max {})",
                tag.len(),
                MAX_TAG_LEN
            )));
        }
        Ok(Selector::NameVersion { name, version })
    }

    /// Parse the textual reference forms accepted on the command line.
    pub fn parse(reference: &str) -> BundleResult<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(BundleError::InvalidReference {
                reference: reference.to_string(),
                reason: "empty reference".to_string(),
            });
        }

        let (body, role) = match reference.rsplit_once('#') {
            Some((body, role)) if !role.is_empty() => (body, Some(role.to_string())),
            Some(_) => {
                return Err(BundleError::InvalidReference {
                    reference: reference.to_string(),
                    reason: "empty role after '#'".to_string(),
                })
            }
            None => (reference, None),
        };

        let mut parsed = if body.starts_with("sha256:") {
            Self::digest(body)
        } else if looks_like_path(body) {
            Self::local(body)
        } else if let Some((name, version)) = body.rsplit_once(':') {
            Self::named(name, version)
        } else {
            return Err(BundleError::InvalidReference {
                reference: reference.to_string(),
                reason: "expected name:version, sha256:<hex>, or a path".to_string(),
            });
        };
        parsed.role = role;
        parsed.selector()?;
        Ok(parsed)
    }

    fn invalid(&self, reason: &str) -> BundleError {
        BundleError::InvalidReference {
            reference: self.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn looks_like_path(s: &str) -> bool {
    s == "."
        || s == ".."
        || s.starts_with("./")
        || s.starts_with("../")
        || s.starts_with('/')
        || s.starts_with('~')
        || (s.len() >= 3
            && s.as_bytes()[0].is_ascii_alphabetic()
            && s.as_bytes()[1] == b':'
            && matches!(s.as_bytes()[2], b'/' | b'\\'))
}

impl fmt::Display for BundleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(path) = &self.local_path {
            parts.push(path.display().to_string());
        }
        if let Some(digest) = &self.digest {
            parts.push(digest.clone());
        }
        match (&self.name, &self.version) {
            (Some(n), Some(v)) => parts.push(format!("{}:{}", n, v)),
            (Some(n), None) => parts.push(n.clone()),
            (None, Some(v)) => parts.push(format!(":{}", v)),
            (None, None) => {}
        }
        if parts.is_empty() {
            parts.push("<empty>".to_string());
        }
        write!(f, "{}", parts.join("+"))?;
        if let Some(role) = &self.role {
            write!(f, "#{}", role)?;
        }
        Ok(())
    }
}

impl FromStr for BundleRef {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Validate a bundle name: lowercase alphanumerics and hyphens, `/` between segments.
pub fn validate_bundle_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("bundle name is empty".to_string());
    }
    if name.len() > 96 {
        return Err(format!("bundle name is {} characters (max 96)", name.len()));
    }
    for segment in name.split('/') {
        if segment.is_empty() {
            return Err("bundle name has an empty '/' segment".to_string());
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(format!(
                "bundle name segment '{}' must be lowercase alphanumeric or '-'",
                segment
            ));
        }
        if segment.starts_with('-') || segment.ends_with('-') {
            return Err(format!(
                "bundle name segment '{}' must not start or end with '-'",
                segment
            ));
        }
        if segment.contains(TAG_SEPARATOR) {
            return Err(format!(
                "bundle name segment '{}' must not contain '--'",
                segment
            ));
        }
    }
    Ok(())
}

/// Validate a version string.
pub fn validate_version(version: &str) -> Result<(), String> {
    if version.is_empty() || version.len() > MAX_TAG_LEN {
        return Err(format!("version must be 1..={} characters", MAX_TAG_LEN));
    }
    if !version.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(format!(
            "version '{}' must start with a letter or digit",
            version
        ));
    }
    if !version
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-'))
    {
        return Err(format!(
            "version '{}' may only contain letters, digits, '.', '_', '+', '-'",
            version
        ));
    }
    Ok(())
}

/// Validate a role or layer name.
pub fn validate_role_name(role: &str) -> Result<(), String> {
    if role.is_empty() || role.len() > 64 {
        return Err("role and layer names must be 1..=64 characters".to_string());
    }
    if !role
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(format!(
            "'{}' may only contain letters, digits, '.', '_', '-'",
            role
        ));
    }
    Ok(())
}

/// Registry tag for a name+version pair.
///
/// `/` becomes `.` and `+` becomes `_`; names never contain `--`, so the
/// first `--` separates the two halves unambiguously.
pub fn version_tag(name: &str, version: &str) -> String {
    format!(
        "{}{}{}",
        name.replace('/', "."),
        TAG_SEPARATOR,
        version.replace('+', "_")
    )
}

/// Alias tag under which a bundle is also reachable by its identity digest.
pub fn digest_alias_tag(digest: &Digest) -> String {
    digest.key()
}
