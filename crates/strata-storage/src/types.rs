//! Shared collaborator types and registry configuration.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strata_core::{Digest, Tier};

/// A manifest fetched from a registry.
#[derive(Debug, Clone)]
pub struct ManifestResponse {
    pub media_type: String,
    /// Registry digest of `bytes`.
    pub digest: Digest,
    pub bytes: Bytes,
}

/// Result of a manifest HEAD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestHead {
    pub digest: Digest,
    pub media_type: String,
    pub size: u64,
}

/// What an external store knows about an object without downloading it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalStat {
    pub uri: String,
    pub size_bytes: u64,
    /// `None` when the object was written without a hash sidecar.
    pub content_hash: Option<Digest>,
    pub tier: Option<Tier>,
}

/// Registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry host (`registry.example.com:5000`) or base URL.
    pub url: String,

    /// Repository inside the registry (`team/models`).
    pub repository: String,

    /// Use plain HTTP when `url` has no scheme.
    #[serde(default)]
    pub insecure: bool,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Static bearer token; skips the token challenge flow.
    #[serde(default)]
    pub token: Option<String>,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

/// Retries beyond this add nothing: backoff is already capped at 30s.
pub const MAX_RETRIES: u32 = 10;

impl RegistryConfig {
    pub fn new(url: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            repository: repository.into(),
            insecure: false,
            username: None,
            password: None,
            token: None,
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
        }
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Clamped to [`MAX_RETRIES`].
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries.min(MAX_RETRIES);
        self
    }

    /// Base URL with scheme and without a trailing slash.
    pub fn base_url(&self) -> String {
        let url = self.url.trim_end_matches('/');
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if self.insecure {
            format!("http://{}", url)
        } else {
            format!("https://{}", url)
        }
    }
}
