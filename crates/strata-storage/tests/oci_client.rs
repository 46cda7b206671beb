//! Integration tests for OciRegistryClient.
//!
//! Uses wiremock for HTTP mocking. Tests cover blob and manifest operations,
//! status mapping (401/403/404/429/5xx), the bearer token challenge, and retry.

use bytes::Bytes;
use strata_core::{media, Digest};
use strata_storage::{
    BundleRegistry, OciRegistryClient, RegistryConfig, StorageError, REGISTRY_USER_AGENT,
};
use wiremock::matchers::{body_bytes, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const REPO: &str = "team/models";

fn config(mock_server: &MockServer) -> RegistryConfig {
    RegistryConfig::new(mock_server.uri(), REPO)
        .with_token("test-token")
        .with_max_retries(0)
}

async fn create_test_client(mock_server: &MockServer) -> OciRegistryClient {
    OciRegistryClient::new(config(mock_server)).expect("failed to create client")
}

#[tokio::test]
async fn test_get_blob_verifies_digest() {
    let mock_server = MockServer::start().await;
    let content = b"blob content";
    let digest = Digest::of_bytes(content);

    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/blobs/{}", REPO, digest)))
        .and(header("authorization", "Bearer test-token"))
        .and(header("user-agent", REGISTRY_USER_AGENT))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.to_vec()))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server).await;
    let bytes = client.get_blob(&digest).await.expect("fetch failed");
    assert_eq!(&bytes[..], content);
}

#[tokio::test]
async fn test_get_blob_tampered_body() {
    let mock_server = MockServer::start().await;
    let digest = Digest::of_bytes(b"expected");

    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/blobs/{}", REPO, digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server).await;
    let result = client.get_blob(&digest).await;
    assert!(matches!(result, Err(StorageError::DigestMismatch { .. })));
}

#[tokio::test]
async fn test_blob_exists_maps_404_to_false() {
    let mock_server = MockServer::start().await;
    let present = Digest::of_bytes(b"present");
    let absent = Digest::of_bytes(b"absent");

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{}/blobs/{}", REPO, present)))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{}/blobs/{}", REPO, absent)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server).await;
    assert!(client.blob_exists(&present).await.unwrap());
    assert!(!client.blob_exists(&absent).await.unwrap());
}

#[tokio::test]
async fn test_put_blob_monolithic_upload() {
    let mock_server = MockServer::start().await;
    let content = b"layer index";
    let digest = Digest::of_bytes(content);

    Mock::given(method("POST"))
        .and(path(format!("/v2/{}/blobs/uploads/", REPO)))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("location", format!("/v2/{}/blobs/uploads/session-1?state=abc", REPO)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/v2/{}/blobs/uploads/session-1", REPO)))
        .and(query_param("state", "abc"))
        .and(query_param("digest", digest.as_str()))
        .and(header("content-type", "application/octet-stream"))
        .and(body_bytes(content.to_vec()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server).await;
    client
        .put_blob(&digest, Bytes::from_static(content))
        .await
        .expect("upload failed");
}

#[tokio::test]
async fn test_put_blob_refuses_wrong_digest_locally() {
    let mock_server = MockServer::start().await;
    let client = create_test_client(&mock_server).await;
    let result = client
        .put_blob(&Digest::of_bytes(b"a"), Bytes::from_static(b"b"))
        .await;
    assert!(matches!(result, Err(StorageError::DigestMismatch { .. })));
}

#[tokio::test]
async fn test_get_manifest_by_tag() {
    let mock_server = MockServer::start().await;
    let body = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json"}"#;
    let digest = Digest::of_bytes(body);

    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/manifests/team.churn--1.0.0", REPO)))
        .and(header("accept", media::OCI_IMAGE_MANIFEST))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(body.to_vec(), media::OCI_IMAGE_MANIFEST)
                .insert_header("docker-content-digest", digest.as_str()),
        )
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server).await;
    let manifest = client.get_manifest("team.churn--1.0.0").await.unwrap();
    assert_eq!(manifest.digest, digest);
    assert_eq!(manifest.media_type, media::OCI_IMAGE_MANIFEST);
    assert_eq!(&manifest.bytes[..], body);
}

#[tokio::test]
async fn test_get_manifest_wrong_digest_header() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/manifests/v1", REPO)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(b"{}".to_vec(), media::OCI_IMAGE_MANIFEST)
                .insert_header("docker-content-digest", Digest::of_bytes(b"other").as_str()),
        )
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server).await;
    let result = client.get_manifest("v1").await;
    assert!(matches!(result, Err(StorageError::DigestMismatch { .. })));
}

#[tokio::test]
async fn test_head_manifest_missing() {
    let mock_server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{}/manifests/missing", REPO)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server).await;
    assert!(client.head_manifest("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_put_manifest_with_tag() {
    let mock_server = MockServer::start().await;
    let body = Bytes::from_static(b"{\"schemaVersion\":2}");
    let digest = Digest::of_bytes(&body);

    Mock::given(method("PUT"))
        .and(path(format!("/v2/{}/manifests/v2", REPO)))
        .and(header("content-type", media::OCI_IMAGE_MANIFEST))
        .respond_with(
            ResponseTemplate::new(201).insert_header("docker-content-digest", digest.as_str()),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server).await;
    let pushed = client
        .put_manifest(media::OCI_IMAGE_MANIFEST, body, Some("v2"))
        .await
        .unwrap();
    assert_eq!(pushed, digest);
}

#[tokio::test]
async fn test_forbidden_is_unauthorized() {
    let mock_server = MockServer::start().await;
    let digest = Digest::of_bytes(b"x");

    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/blobs/{}", REPO, digest)))
        .respond_with(ResponseTemplate::new(403))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server).await;
    let result = client.get_blob(&digest).await;
    assert!(matches!(result, Err(StorageError::Unauthorized { .. })));
}

#[tokio::test]
async fn test_bearer_challenge_exchanges_basic_credentials() {
    let mock_server = MockServer::start().await;
    let digest = Digest::of_bytes(b"secret blob");

    // Token endpoint: basic auth for user:pass.
    Mock::given(method("GET"))
        .and(path("/token"))
        .and(query_param("service", "registry.test"))
        .and(header("authorization", "Basic dXNlcjpwYXNz"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"token":"fresh-token"}"#))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/blobs/{}", REPO, digest)))
        .and(header("authorization", "Bearer fresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"secret blob".to_vec()))
        .with_priority(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/blobs/{}", REPO, digest)))
        .respond_with(ResponseTemplate::new(401).insert_header(
            "www-authenticate",
            format!(
                r#"Bearer realm="{}/token",service="registry.test",scope="repository:{}:pull""#,
                mock_server.uri(),
                REPO
            )
            .as_str(),
        ))
        .mount(&mock_server)
        .await;

    let config = RegistryConfig::new(mock_server.uri(), REPO)
        .with_basic_auth("user", "pass")
        .with_max_retries(0);
    let client = OciRegistryClient::new(config).unwrap();

    let bytes = client.get_blob(&digest).await.expect("challenge flow failed");
    assert_eq!(&bytes[..], b"secret blob");

    // Token is cached: second call does not hit the token endpoint again.
    client.get_blob(&digest).await.unwrap();
}

#[tokio::test]
async fn test_retry_on_429_with_retry_after() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/manifests/busy", REPO)))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = OciRegistryClient::new(config(&mock_server).with_max_retries(1)).unwrap();

    let start = std::time::Instant::now();
    let result = client.get_manifest("busy").await;
    let elapsed = start.elapsed();

    assert!(
        matches!(result, Err(StorageError::RateLimited { .. })),
        "Should fail with RateLimited"
    );
    assert!(
        elapsed.as_millis() >= 850,
        "Should have waited for retry-after (with jitter), elapsed: {:?}",
        elapsed
    );
}

#[tokio::test]
async fn test_server_error_retried_then_surfaced() {
    let mock_server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{}/manifests/flaky", REPO)))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = OciRegistryClient::new(config(&mock_server).with_max_retries(1)).unwrap();
    let result = client.head_manifest("flaky").await;
    assert!(matches!(result, Err(StorageError::Server { status: 503, .. })));
}

#[tokio::test]
async fn test_other_status_not_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/manifests/bad", REPO)))
        .respond_with(ResponseTemplate::new(400).set_body_string("MANIFEST_INVALID"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = OciRegistryClient::new(config(&mock_server).with_max_retries(3)).unwrap();
    let result = client.get_manifest("bad").await;
    match result {
        Err(StorageError::Http { status, message }) => {
            assert_eq!(status, 400);
            assert!(message.contains("MANIFEST_INVALID"));
        }
        other => panic!("expected Http error, got {:?}", other.map(|m| m.digest)),
    }
}
