//! OCI distribution v2 client bound to one repository.
//!
//! Public API: no status code knowledge. All HTTP/status mapping in http.rs.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, USER_AGENT};
use reqwest::Method;
use strata_core::{media, Digest};
use tracing::{debug, info};

use super::{verify_blob, BundleRegistry};
use crate::error::{StorageError, StorageResult};
use crate::types::{ManifestHead, ManifestResponse, RegistryConfig};

pub mod auth;
mod http;

pub use auth::Credentials;
use http::{HttpBackend, RequestSpec};

pub const REGISTRY_USER_AGENT: &str = concat!("strata/", env!("CARGO_PKG_VERSION"));

const DIGEST_HEADER: &str = "docker-content-digest";

/// Registry client speaking the OCI distribution API.
#[derive(Debug, Clone)]
pub struct OciRegistryClient {
    http: HttpBackend,
    base_url: String,
    repository: String,
}

impl OciRegistryClient {
    pub fn new(config: RegistryConfig) -> StorageResult<Self> {
        if config.repository.trim_matches('/').is_empty() {
            return Err(StorageError::Config {
                message: "registry repository is empty".to_string(),
            });
        }

        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(REGISTRY_USER_AGENT));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(default_headers)
            .build()
            .map_err(|e| StorageError::Config {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            http: HttpBackend::new(client, Credentials::from_config(&config), config.max_retries),
            base_url: config.base_url(),
            repository: config.repository.trim_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn is_authenticated(&self) -> bool {
        self.http.credentials.is_authenticated()
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/v2/{}/{}", self.base_url, self.repository, suffix)
    }

    fn blob_url(&self, digest: &Digest) -> String {
        self.url(&format!("blobs/{}", digest))
    }

    fn manifest_url(&self, reference: &str) -> String {
        self.url(&format!("manifests/{}", reference))
    }

    /// Resolve a possibly relative upload `Location` and append `digest=`.
    fn upload_target(&self, location: &str, digest: &Digest) -> StorageResult<String> {
        let base = url::Url::parse(&self.base_url).map_err(|e| StorageError::Config {
            message: format!("invalid registry URL '{}': {}", self.base_url, e),
        })?;
        let mut target = base.join(location).map_err(|e| StorageError::InvalidResponse {
            message: format!("invalid upload location '{}': {}", location, e),
        })?;
        target.query_pairs_mut().append_pair("digest", digest.as_str());
        Ok(target.to_string())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Content-Type without parameters.
fn media_type_of(headers: &HeaderMap) -> Option<String> {
    header_str(headers, CONTENT_TYPE.as_str())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .filter(|v| !v.is_empty())
}

fn digest_header(headers: &HeaderMap) -> StorageResult<Option<Digest>> {
    header_str(headers, DIGEST_HEADER)
        .map(|raw| {
            Digest::parse(raw.trim()).map_err(|e| StorageError::InvalidResponse {
                message: format!("bad {} header: {}", DIGEST_HEADER, e),
            })
        })
        .transpose()
}

#[async_trait]
impl BundleRegistry for OciRegistryClient {
    async fn blob_exists(&self, digest: &Digest) -> StorageResult<bool> {
        let url = self.blob_url(digest);
        let what = format!("blob {}", digest);
        match self.http.send(RequestSpec::new(Method::HEAD, &url, &what)).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_blob(&self, digest: &Digest) -> StorageResult<Bytes> {
        let url = self.blob_url(digest);
        let what = format!("blob {} in {}", digest, self.repository);
        debug!(url = %url, "fetching blob");

        let response = self.http.send(RequestSpec::new(Method::GET, &url, &what)).await?;
        let bytes = response.bytes().await.map_err(|e| StorageError::Network {
            message: format!("failed to read blob body: {}", e),
        })?;
        verify_blob(&what, digest, &bytes)?;
        Ok(bytes)
    }

    async fn put_blob(&self, digest: &Digest, bytes: Bytes) -> StorageResult<()> {
        verify_blob(&format!("upload of blob {}", digest), digest, &bytes)?;

        let start_url = self.url("blobs/uploads/");
        let what = format!("upload session in {}", self.repository);
        let response = self
            .http
            .send(RequestSpec::new(Method::POST, &start_url, &what))
            .await?;
        let location = header_str(response.headers(), LOCATION.as_str())
            .ok_or_else(|| StorageError::InvalidResponse {
                message: "blob upload start returned no Location header".to_string(),
            })?
            .to_string();

        let target = self.upload_target(&location, digest)?;
        let what = format!("blob upload {}", digest);
        self.http
            .send(
                RequestSpec::new(Method::PUT, &target, &what)
                    .body("application/octet-stream", bytes),
            )
            .await?;
        debug!(digest = %digest, "blob uploaded");
        Ok(())
    }

    async fn get_manifest(&self, reference: &str) -> StorageResult<ManifestResponse> {
        let url = self.manifest_url(reference);
        let what = format!("manifest {}:{}", self.repository, reference);
        debug!(url = %url, "fetching manifest");

        let response = self
            .http
            .send(RequestSpec::new(Method::GET, &url, &what).accept(media::OCI_IMAGE_MANIFEST))
            .await?;
        let headers = response.headers().clone();
        let bytes = response.bytes().await.map_err(|e| StorageError::Network {
            message: format!("failed to read manifest body: {}", e),
        })?;

        let computed = Digest::of_bytes(&bytes);
        if let Ok(requested) = Digest::parse(reference) {
            verify_blob(&what, &requested, &bytes)?;
        }
        if let Some(declared) = digest_header(&headers)? {
            if declared != computed {
                return Err(StorageError::DigestMismatch {
                    subject: what,
                    expected: declared.to_string(),
                    actual: computed.to_string(),
                });
            }
        }

        let media_type = match media_type_of(&headers) {
            Some(m) => m,
            None => serde_json::from_slice::<serde_json::Value>(&bytes)
                .ok()
                .and_then(|v| v.get("mediaType").and_then(|m| m.as_str()).map(String::from))
                .unwrap_or_default(),
        };

        Ok(ManifestResponse {
            media_type,
            digest: computed,
            bytes,
        })
    }

    async fn put_manifest(
        &self,
        media_type: &str,
        bytes: Bytes,
        tag: Option<&str>,
    ) -> StorageResult<Digest> {
        let computed = Digest::of_bytes(&bytes);
        let reference = tag.map(String::from).unwrap_or_else(|| computed.to_string());
        let url = self.manifest_url(&reference);
        let what = format!("manifest {}:{}", self.repository, reference);

        let response = self
            .http
            .send(RequestSpec::new(Method::PUT, &url, &what).body(media_type, bytes))
            .await?;
        if let Some(declared) = digest_header(response.headers())? {
            if declared != computed {
                return Err(StorageError::InvalidResponse {
                    message: format!(
                        "registry stored manifest as {} but its bytes hash to {}",
                        declared, computed
                    ),
                });
            }
        }
        info!(repository = %self.repository, reference = %reference, digest = %computed, "manifest pushed");
        Ok(computed)
    }

    async fn head_manifest(&self, reference: &str) -> StorageResult<Option<ManifestHead>> {
        let url = self.manifest_url(reference);
        let what = format!("manifest {}:{}", self.repository, reference);

        let response = match self
            .http
            .send(RequestSpec::new(Method::HEAD, &url, &what).accept(media::OCI_IMAGE_MANIFEST))
            .await
        {
            Ok(r) => r,
            Err(StorageError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let headers = response.headers();
        let size = header_str(headers, CONTENT_LENGTH.as_str()).and_then(|v| v.parse().ok());
        match (digest_header(headers)?, media_type_of(headers), size) {
            (Some(digest), Some(media_type), Some(size)) => Ok(Some(ManifestHead {
                digest,
                media_type,
                size,
            })),
            // Some registries omit headers on HEAD; fall back to a GET.
            _ => {
                let manifest = self.get_manifest(reference).await?;
                Ok(Some(ManifestHead {
                    size: manifest.bytes.len() as u64,
                    digest: manifest.digest,
                    media_type: manifest.media_type,
                }))
            }
        }
    }

    fn location(&self) -> String {
        format!("{}/{}", self.base_url, self.repository)
    }
}
