//! The `.strata/provenance.json` record left in every materialized tree.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::canonical::CanonicalBytes;
use crate::digest::Digest;
use crate::error::{BundleError, BundleResult};

pub const PROVENANCE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub schema_version: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub manifest_digest: Digest,
    pub role: String,
    pub layers: Vec<String>,
    pub materialized_at: DateTime<Utc>,
    /// Inline inventory: bundle path to content hash.
    pub files: BTreeMap<String, Digest>,
}

impl Provenance {
    pub fn to_bytes(&self) -> BundleResult<Vec<u8>> {
        Ok(CanonicalBytes::new(self)?.into_vec())
    }

    pub fn from_bytes(bytes: &[u8]) -> BundleResult<Self> {
        let record: Self = serde_json::from_slice(bytes)
            .map_err(|e| BundleError::validation(format!("malformed provenance record: {}", e)))?;
        if record.schema_version != PROVENANCE_SCHEMA_VERSION {
            return Err(BundleError::validation(format!(
                "provenance schemaVersion {} is not supported",
                record.schema_version
            )));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_bytes_parse_back() {
        let mut files = BTreeMap::new();
        files.insert("b.txt".to_string(), Digest::of_bytes(b"b"));
        files.insert("a.txt".to_string(), Digest::of_bytes(b"a"));
        let record = Provenance {
            schema_version: PROVENANCE_SCHEMA_VERSION,
            name: Some("team/model".into()),
            version: Some("1.0.0".into()),
            manifest_digest: Digest::of_bytes(b"m"),
            role: "runtime".into(),
            layers: vec!["code".into()],
            materialized_at: DateTime::<Utc>::UNIX_EPOCH,
            files,
        };
        let bytes = record.to_bytes().unwrap();
        assert!(!bytes.contains(&b'\n'));
        assert!(String::from_utf8_lossy(&bytes).starts_with("{\"files\":{\"a.txt\""));
        assert_eq!(Provenance::from_bytes(&bytes).unwrap(), record);
    }
}
