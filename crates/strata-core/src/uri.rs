//! External storage URIs (`s3://bucket/key`, `az://container/key`, ...).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BundleError, BundleResult};

/// Schemes the object-store adapter knows how to reach.
pub const SUPPORTED_SCHEMES: &[&str] = &["s3", "az", "gs", "file", "memory"];

/// A parsed external URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExternalUri {
    pub scheme: String,
    pub container: String,
    pub key: String,
}

impl ExternalUri {
    pub fn parse(raw: &str) -> BundleResult<Self> {
        let invalid = |reason: &str| BundleError::validation(format!("invalid external URI '{}': {}", raw, reason));

        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| invalid("missing '://'"))?;
        if !SUPPORTED_SCHEMES.contains(&scheme) {
            return Err(invalid(&format!(
                "unsupported scheme '{}' (expected one of {})",
                scheme,
                SUPPORTED_SCHEMES.join(", ")
            )));
        }
        if rest.contains('\\') {
            return Err(invalid("backslashes are not allowed"));
        }

        // file:///abs/path has an empty authority; the first path segment acts as container.
        let rest = if scheme == "file" {
            rest.strip_prefix('/').unwrap_or(rest)
        } else {
            rest
        };

        let (container, key) = rest
            .split_once('/')
            .ok_or_else(|| invalid("expected <container>/<key>"))?;
        if container.is_empty() {
            return Err(invalid("empty container"));
        }
        if key.is_empty() {
            return Err(invalid("empty key"));
        }
        if key.split('/').any(|s| s.is_empty() || s == "." || s == "..") {
            return Err(invalid("key has empty, '.' or '..' segments"));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            container: container.to_string(),
            key: key.to_string(),
        })
    }
}

impl fmt::Display for ExternalUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scheme == "file" {
            write!(f, "file:///{}/{}", self.container, self.key)
        } else {
            write!(f, "{}://{}/{}", self.scheme, self.container, self.key)
        }
    }
}

impl FromStr for ExternalUri {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ExternalUri {
    type Error = BundleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ExternalUri> for String {
    fn from(value: ExternalUri) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cloud_schemes() {
        let uri = ExternalUri::parse("az://models/data/train.csv").unwrap();
        assert_eq!(uri.scheme, "az");
        assert_eq!(uri.container, "models");
        assert_eq!(uri.key, "data/train.csv");
        assert_eq!(uri.to_string(), "az://models/data/train.csv");

        assert!(ExternalUri::parse("s3://bucket/k").is_ok());
        assert!(ExternalUri::parse("gs://bucket/a/b").is_ok());
    }

    #[test]
    fn test_parse_file_scheme() {
        let uri = ExternalUri::parse("file:///srv/blobs/x.bin").unwrap();
        assert_eq!(uri.container, "srv");
        assert_eq!(uri.key, "blobs/x.bin");
        assert_eq!(uri.to_string(), "file:///srv/blobs/x.bin");
    }

    #[test]
    fn test_rejects_bad_uris() {
        for bad in [
            "http://host/x",
            "s3://bucket",
            "s3:///key",
            "s3://bucket/",
            "s3://bucket/a/../b",
            "s3://bucket/a//b",
            "az://c/a\\b",
            "bucket/key",
        ] {
            assert!(ExternalUri::parse(bad).is_err(), "accepted {bad}");
        }
    }
}
