//! Environment configuration for the binary.
//!
//! Libraries never read the environment; everything is collected here and
//! passed down as config structs.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use strata_core::{BundleError, BundleResult};
use strata_engine::{CacheConfig, ContentCache};
use strata_storage::{BundleRegistry, OciRegistryClient, RegistryConfig};

pub const ENV_REGISTRY_URL: &str = "STRATA_REGISTRY_URL";
pub const ENV_REGISTRY_REPO: &str = "STRATA_REGISTRY_REPO";
pub const ENV_REGISTRY_INSECURE: &str = "STRATA_REGISTRY_INSECURE";
pub const ENV_REGISTRY_USERNAME: &str = "STRATA_REGISTRY_USERNAME";
pub const ENV_REGISTRY_PASSWORD: &str = "STRATA_REGISTRY_PASSWORD";
pub const ENV_REGISTRY_TOKEN: &str = "STRATA_REGISTRY_TOKEN";
pub const ENV_HTTP_TIMEOUT: &str = "STRATA_HTTP_TIMEOUT";
pub const ENV_HTTP_RETRY: &str = "STRATA_HTTP_RETRY";
pub const ENV_CACHE_DIR: &str = "STRATA_CACHE_DIR";
pub const ENV_SOURCE_DATE_EPOCH: &str = "SOURCE_DATE_EPOCH";

#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// `None` unless both URL and repository are set.
    pub registry: Option<RegistryConfig>,
    /// Explicit cache root; the platform default otherwise.
    pub cache_dir: Option<PathBuf>,
    /// Fixed timestamp for provenance and pointer files.
    pub source_date: Option<DateTime<Utc>>,
}

impl Settings {
    pub fn from_env() -> BundleResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BundleResult<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let registry = match (get(ENV_REGISTRY_URL), get(ENV_REGISTRY_REPO)) {
            (Some(url), Some(repo)) => {
                let mut config = RegistryConfig::new(url, repo);
                if let Some(raw) = get(ENV_REGISTRY_INSECURE) {
                    config = config.with_insecure(parse_flag(ENV_REGISTRY_INSECURE, &raw)?);
                }
                match (get(ENV_REGISTRY_USERNAME), get(ENV_REGISTRY_PASSWORD)) {
                    (Some(user), Some(pass)) => config = config.with_basic_auth(user, pass),
                    (None, None) => {}
                    _ => {
                        return Err(BundleError::validation(format!(
                            "{} and {} must be set together",
                            ENV_REGISTRY_USERNAME, ENV_REGISTRY_PASSWORD
                        )))
                    }
                }
                if let Some(token) = get(ENV_REGISTRY_TOKEN) {
                    config = config.with_token(token);
                }
                if let Some(raw) = get(ENV_HTTP_TIMEOUT) {
                    config = config.with_timeout_secs(parse_number(ENV_HTTP_TIMEOUT, &raw)?);
                }
                if let Some(raw) = get(ENV_HTTP_RETRY) {
                    config = config.with_max_retries(parse_number(ENV_HTTP_RETRY, &raw)?);
                }
                Some(config)
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(BundleError::validation(format!(
                    "{} is set but {} is not",
                    ENV_REGISTRY_URL, ENV_REGISTRY_REPO
                )))
            }
            (None, Some(_)) => {
                return Err(BundleError::validation(format!(
                    "{} is set but {} is not",
                    ENV_REGISTRY_REPO, ENV_REGISTRY_URL
                )))
            }
        };

        let source_date = match get(ENV_SOURCE_DATE_EPOCH) {
            Some(raw) => {
                let secs: i64 = parse_number(ENV_SOURCE_DATE_EPOCH, &raw)?;
                let date = Utc.timestamp_opt(secs, 0).single().ok_or_else(|| {
                    BundleError::validation(format!(
                        "{} is out of range: {}",
                        ENV_SOURCE_DATE_EPOCH, raw
                    ))
                })?;
                Some(date)
            }
            None => None,
        };

        Ok(Self {
            registry,
            cache_dir: get(ENV_CACHE_DIR).map(PathBuf::from),
            source_date,
        })
    }

    pub fn registry_client(&self) -> BundleResult<Option<Arc<dyn BundleRegistry>>> {
        match &self.registry {
            Some(config) => {
                let client = OciRegistryClient::new(config.clone())?;
                Ok(Some(Arc::new(client)))
            }
            None => Ok(None),
        }
    }

    pub fn cache(&self) -> BundleResult<ContentCache> {
        let root = match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => CacheConfig::default_root()?,
        };
        Ok(ContentCache::new(CacheConfig::new(root)))
    }
}

fn parse_flag(key: &str, raw: &str) -> BundleResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(BundleError::validation(format!(
            "{} must be a boolean, got '{}'",
            key, raw
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> BundleResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| BundleError::validation(format!("{} must be a number, got '{}'", key, raw)))
}
