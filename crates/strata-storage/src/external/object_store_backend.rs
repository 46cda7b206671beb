//! `ExternalStore` over the `object_store` crate.
//!
//! Supports S3, Azure Blob, GCS, local filesystem and in-memory stores.
//! Stores are built lazily and reused per `(scheme, container)`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, ObjectStoreExt, PutPayload};
use strata_core::{Digest, ExternalUri, Tier};
use tracing::{debug, warn};

use super::{ExternalRecord, ExternalStore, SIDECAR_SUFFIX};
use crate::error::{StorageError, StorageResult};
use crate::types::ExternalStat;

type StoreKey = (String, String);

/// External store dispatching on the URI scheme.
#[derive(Clone, Default)]
pub struct ObjectStoreExternal {
    stores: Arc<Mutex<HashMap<StoreKey, Arc<dyn ObjectStore>>>>,
}

impl std::fmt::Debug for ObjectStoreExternal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.stores.lock().map(|s| s.len()).unwrap_or_default();
        f.debug_struct("ObjectStoreExternal")
            .field("stores", &count)
            .finish()
    }
}

impl ObjectStoreExternal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prebuilt store for `scheme://container/`.
    pub fn with_store(self, scheme: &str, container: &str, store: Arc<dyn ObjectStore>) -> Self {
        if let Ok(mut stores) = self.stores.lock() {
            stores.insert((scheme.to_string(), container.to_string()), store);
        }
        self
    }

    fn store_for(&self, uri: &ExternalUri) -> StorageResult<Arc<dyn ObjectStore>> {
        // file:// stores are rooted at `/`, so one store serves every container.
        let key = if uri.scheme == "file" {
            (uri.scheme.clone(), String::new())
        } else {
            (uri.scheme.clone(), uri.container.clone())
        };

        let mut stores = self.stores.lock().map_err(|_| StorageError::Config {
            message: "object store registry lock poisoned".to_string(),
        })?;
        if let Some(store) = stores.get(&key) {
            return Ok(store.clone());
        }

        let store = build_store(uri)?;
        debug!(scheme = %uri.scheme, container = %uri.container, "built object store");
        stores.insert(key, store.clone());
        Ok(store)
    }
}

fn build_store(uri: &ExternalUri) -> StorageResult<Arc<dyn ObjectStore>> {
    let config_err = |e: object_store::Error| StorageError::Config {
        message: format!("failed to create {} client for '{}': {}", uri.scheme, uri.container, e),
    };

    let store: Arc<dyn ObjectStore> = match uri.scheme.as_str() {
        "memory" => Arc::new(object_store::memory::InMemory::new()),
        "file" => Arc::new(object_store::local::LocalFileSystem::new()),
        "s3" => Arc::new(
            object_store::aws::AmazonS3Builder::from_env()
                .with_bucket_name(&uri.container)
                .build()
                .map_err(config_err)?,
        ),
        "az" => Arc::new(
            object_store::azure::MicrosoftAzureBuilder::from_env()
                .with_container_name(&uri.container)
                .build()
                .map_err(config_err)?,
        ),
        "gs" => Arc::new(
            object_store::gcp::GoogleCloudStorageBuilder::from_env()
                .with_bucket_name(&uri.container)
                .build()
                .map_err(config_err)?,
        ),
        other => {
            return Err(StorageError::Config {
                message: format!("unsupported external scheme '{}'", other),
            })
        }
    };
    Ok(store)
}

fn object_path(uri: &ExternalUri) -> ObjectPath {
    if uri.scheme == "file" {
        ObjectPath::from(format!("{}/{}", uri.container, uri.key))
    } else {
        ObjectPath::from(uri.key.as_str())
    }
}

fn sidecar_path(uri: &ExternalUri) -> ObjectPath {
    let data = object_path(uri);
    ObjectPath::from(format!("{}{}", data.as_ref(), SIDECAR_SUFFIX))
}

impl ObjectStoreExternal {
    async fn read_record(
        &self,
        store: &Arc<dyn ObjectStore>,
        uri: &ExternalUri,
    ) -> StorageResult<Option<ExternalRecord>> {
        let path = sidecar_path(uri);
        let raw = match store.get(&path).await {
            Ok(result) => result
                .bytes()
                .await
                .map_err(|e| StorageError::from_object_store(e, &uri.to_string()))?,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(StorageError::from_object_store(e, &uri.to_string())),
        };
        match serde_json::from_slice::<ExternalRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(uri = %uri, error = %e, "ignoring unreadable hash sidecar");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl ExternalStore for ObjectStoreExternal {
    async fn stat(&self, uri: &ExternalUri) -> StorageResult<Option<ExternalStat>> {
        let store = self.store_for(uri)?;
        let meta = match store.head(&object_path(uri)).await {
            Ok(meta) => meta,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(StorageError::from_object_store(e, &uri.to_string())),
        };
        let size_bytes = meta.size as u64;

        let record = self.read_record(&store, uri).await?;
        let stat = match record {
            Some(record) if record.size_bytes == size_bytes => record.to_stat(),
            Some(record) => {
                warn!(
                    uri = %uri,
                    sidecar_size = record.size_bytes,
                    object_size = size_bytes,
                    "hash sidecar is stale"
                );
                ExternalStat {
                    uri: uri.to_string(),
                    size_bytes,
                    content_hash: None,
                    tier: record.tier,
                }
            }
            None => ExternalStat {
                uri: uri.to_string(),
                size_bytes,
                content_hash: None,
                tier: None,
            },
        };
        Ok(Some(stat))
    }

    async fn get(&self, uri: &ExternalUri) -> StorageResult<Bytes> {
        let store = self.store_for(uri)?;
        debug!(uri = %uri, "fetching external object");
        let result = store
            .get(&object_path(uri))
            .await
            .map_err(|e| StorageError::from_object_store(e, &uri.to_string()))?;
        result
            .bytes()
            .await
            .map_err(|e| StorageError::from_object_store(e, &uri.to_string()))
    }

    async fn put(
        &self,
        uri: &ExternalUri,
        bytes: Bytes,
        expected_hash: Option<&Digest>,
        tier: Option<Tier>,
    ) -> StorageResult<ExternalStat> {
        let actual = Digest::of_bytes(&bytes);
        if let Some(expected) = expected_hash {
            if expected != &actual {
                return Err(StorageError::DigestMismatch {
                    subject: format!("upload to {}", uri),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        let store = self.store_for(uri)?;
        let record = ExternalRecord::new(uri, bytes.len() as u64, actual, tier);
        let sidecar = serde_json::to_vec(&record).map_err(|e| StorageError::Config {
            message: format!("failed to encode sidecar for {}: {}", uri, e),
        })?;

        store
            .put(&object_path(uri), PutPayload::from_bytes(bytes))
            .await
            .map_err(|e| StorageError::from_object_store(e, &uri.to_string()))?;
        store
            .put(&sidecar_path(uri), PutPayload::from_bytes(Bytes::from(sidecar)))
            .await
            .map_err(|e| StorageError::from_object_store(e, &uri.to_string()))?;

        debug!(uri = %uri, size = record.size_bytes, "external object stored");
        Ok(record.to_stat())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> ExternalUri {
        ExternalUri::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_memory_roundtrip_with_sidecar() {
        let store = ObjectStoreExternal::new();
        let u = uri("memory://blobs/data/train.csv");
        let bytes = Bytes::from_static(b"a,b\n1,2\n");
        let hash = Digest::of_bytes(&bytes);

        assert!(store.stat(&u).await.unwrap().is_none());
        let stat = store
            .put(&u, bytes.clone(), Some(&hash), Some(Tier::Cool))
            .await
            .unwrap();
        assert_eq!(stat.content_hash.as_ref(), Some(&hash));

        let stat = store.stat(&u).await.unwrap().unwrap();
        assert_eq!(stat.size_bytes, bytes.len() as u64);
        assert_eq!(stat.content_hash, Some(hash));
        assert_eq!(stat.tier, Some(Tier::Cool));
        assert_eq!(store.get(&u).await.unwrap(), bytes);
    }

    #[tokio::test]
    async fn test_put_hash_mismatch_writes_nothing() {
        let store = ObjectStoreExternal::new();
        let u = uri("memory://blobs/x.bin");
        let err = store
            .put(&u, Bytes::from_static(b"x"), Some(&Digest::of_bytes(b"y")), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DigestMismatch { .. }));
        assert!(store.stat(&u).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_containers_are_isolated() {
        let store = ObjectStoreExternal::new();
        store
            .put(&uri("memory://a/k"), Bytes::from_static(b"1"), None, None)
            .await
            .unwrap();
        assert!(store.get(&uri("memory://b/k")).await.unwrap_err().is_not_found());
        // Clones share the memoized stores.
        assert_eq!(
            store.clone().get(&uri("memory://a/k")).await.unwrap(),
            Bytes::from_static(b"1")
        );
    }

    #[tokio::test]
    async fn test_file_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap().trim_start_matches('/');
        let u = uri(&format!("file:///{}/nested/blob.bin", root));
        let store = ObjectStoreExternal::new();
        store
            .put(&u, Bytes::from_static(b"payload"), None, None)
            .await
            .unwrap();
        assert!(dir.path().join("nested/blob.bin").exists());
        assert!(dir.path().join("nested/blob.bin.sha256").exists());
        let stat = store.stat(&u).await.unwrap().unwrap();
        assert_eq!(stat.content_hash, Some(Digest::of_bytes(b"payload")));
    }

    #[tokio::test]
    async fn test_object_without_sidecar_has_no_hash() {
        let memory: Arc<dyn ObjectStore> = Arc::new(object_store::memory::InMemory::new());
        memory
            .put(&ObjectPath::from("raw.bin"), PutPayload::from_static(b"raw"))
            .await
            .unwrap();
        let store = ObjectStoreExternal::new().with_store("memory", "pre", memory);
        let stat = store.stat(&uri("memory://pre/raw.bin")).await.unwrap().unwrap();
        assert_eq!(stat.size_bytes, 3);
        assert!(stat.content_hash.is_none());
    }
}
