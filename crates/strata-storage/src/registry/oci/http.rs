//! HTTP layer: status mapping, retry, token challenge.
//!
//! This is the ONLY place for status code handling. oci/mod.rs never
//! interprets status codes.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::auth::{parse_bearer_challenge, BearerChallenge, Credentials, TokenResponse};
use crate::error::{StorageError, StorageResult};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Upper bound of the jittered wait before retry number `retry` (from 1).
fn backoff_ceiling(retry: u32) -> Duration {
    let secs = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

/// One logical request; cloned per attempt.
#[derive(Debug, Clone)]
pub(crate) struct RequestSpec<'a> {
    pub method: reqwest::Method,
    pub url: &'a str,
    /// Used in NotFound messages.
    pub what: &'a str,
    pub accept: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub body: Option<Bytes>,
}

impl<'a> RequestSpec<'a> {
    pub(crate) fn new(method: reqwest::Method, url: &'a str, what: &'a str) -> Self {
        Self {
            method,
            url,
            what,
            accept: None,
            content_type: None,
            body: None,
        }
    }

    pub(crate) fn accept(mut self, media_type: &'a str) -> Self {
        self.accept = Some(media_type);
        self
    }

    pub(crate) fn body(mut self, content_type: &'a str, body: Bytes) -> Self {
        self.content_type = Some(content_type);
        self.body = Some(body);
        self
    }
}

enum Attempt {
    Done(reqwest::Response),
    Challenged(BearerChallenge),
}

/// HTTP backend for making requests (holds reqwest client, credentials, token cache).
#[derive(Debug, Clone)]
pub(crate) struct HttpBackend {
    pub(crate) client: reqwest::Client,
    pub(crate) credentials: Credentials,
    pub(crate) max_retries: u32,
    token: Arc<RwLock<Option<String>>>,
}

impl HttpBackend {
    pub(crate) fn new(client: reqwest::Client, credentials: Credentials, max_retries: u32) -> Self {
        Self {
            client,
            credentials,
            max_retries,
            token: Arc::default(),
        }
    }

    /// Send with bounded retry; a bearer challenge is answered once per call.
    pub(crate) async fn send(&self, spec: RequestSpec<'_>) -> StorageResult<reqwest::Response> {
        use rand::Rng;

        let mut retries = 0;
        let mut challenged = false;

        loop {
            let result = self.send_once(&spec, !challenged).await;

            match result {
                Ok(Attempt::Done(response)) => return Ok(response),
                Ok(Attempt::Challenged(challenge)) => {
                    challenged = true;
                    self.refresh_token(&challenge).await?;
                }
                Err(e) if e.is_retryable() && retries < self.max_retries => {
                    retries += 1;

                    let backoff = match &e {
                        StorageError::RateLimited {
                            retry_after: Some(retry_after),
                        } => {
                            let capped = (*retry_after).min(MAX_BACKOFF);
                            let base_ms = capped.as_millis() as u64;
                            let jitter_factor: f64 =
                                rand::thread_rng().gen_range(0.9_f64..=1.1_f64);
                            let jittered_ms = ((base_ms as f64) * jitter_factor).round() as u64;
                            Duration::from_millis(jittered_ms.max(100))
                        }
                        _ => {
                            let base_backoff = backoff_ceiling(retries);
                            let jittered_ms =
                                rand::thread_rng().gen_range(0..=base_backoff.as_millis() as u64);
                            Duration::from_millis(jittered_ms.max(10))
                        }
                    };

                    warn!(
                        error = %e,
                        url = spec.url,
                        retry = retries,
                        max_retries = self.max_retries,
                        backoff_ms = backoff.as_millis(),
                        "retrying registry request"
                    );

                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(&self, spec: &RequestSpec<'_>, may_challenge: bool) -> StorageResult<Attempt> {
        let mut request = self.client.request(spec.method.clone(), spec.url);

        if let Some(auth) = self.authorization().await {
            request = request.header(AUTHORIZATION, auth);
        }
        if let Some(accept) = spec.accept {
            request = request.header(ACCEPT, accept);
        }
        if let Some(content_type) = spec.content_type {
            request = request.header(CONTENT_TYPE, content_type);
        }
        if let Some(body) = &spec.body {
            request = request.body(body.clone());
        }

        let response = request.send().await?;
        let status = response.status();
        debug!(method = %spec.method, url = spec.url, status = status.as_u16(), "registry response");

        match status.as_u16() {
            200..=299 => Ok(Attempt::Done(response)),

            401 => {
                let challenge = response
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_bearer_challenge);
                match challenge {
                    Some(c) if may_challenge && !matches!(self.credentials, Credentials::Bearer(_)) => {
                        Ok(Attempt::Challenged(c))
                    }
                    _ => Err(StorageError::Unauthorized {
                        message: format!("{} {}: credentials rejected", spec.method, spec.url),
                    }),
                }
            }

            403 => Err(StorageError::Unauthorized {
                message: format!("{} {}: access denied", spec.method, spec.url),
            }),

            404 => Err(StorageError::NotFound {
                what: spec.what.to_string(),
            }),

            429 => {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);

                Err(StorageError::RateLimited { retry_after })
            }

            500..=599 => {
                let message = response.text().await.unwrap_or_else(|_| status.to_string());
                Err(StorageError::Server {
                    status: status.as_u16(),
                    message: truncate(&message),
                })
            }

            _ => {
                let message = response.text().await.unwrap_or_else(|_| status.to_string());
                Err(StorageError::Http {
                    status: status.as_u16(),
                    message: truncate(&message),
                })
            }
        }
    }

    async fn authorization(&self) -> Option<String> {
        if let Credentials::Bearer(token) = &self.credentials {
            return Some(format!("Bearer {}", token));
        }
        if let Some(token) = self.token.read().await.as_ref() {
            return Some(format!("Bearer {}", token));
        }
        self.credentials.basic_header()
    }

    async fn refresh_token(&self, challenge: &BearerChallenge) -> StorageResult<()> {
        let url = challenge.token_url().map_err(|e| StorageError::InvalidResponse {
            message: format!("bad token realm '{}': {}", challenge.realm, e),
        })?;
        debug!(realm = %challenge.realm, scope = ?challenge.scope, "requesting registry token");

        let mut request = self.client.get(url);
        if let Some(basic) = self.credentials.basic_header() {
            request = request.header(AUTHORIZATION, basic);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::Unauthorized {
                message: format!("token endpoint {} returned HTTP {}", challenge.realm, status.as_u16()),
            });
        }

        let body: TokenResponse = response.json().await.map_err(|e| StorageError::InvalidResponse {
            message: format!("failed to parse token response: {}", e),
        })?;
        let token = body.into_token().ok_or_else(|| StorageError::InvalidResponse {
            message: "token response carries no token".to_string(),
        })?;
        *self.token.write().await = Some(token);
        Ok(())
    }
}

fn truncate(message: &str) -> String {
    message.chars().take(200).collect()
}
