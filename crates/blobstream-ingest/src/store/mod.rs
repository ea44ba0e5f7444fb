//! Remote blob store interface
//!
//! The engine never manages credentials or listing pagination; it walks the
//! handles discovery hands it and opens ranged reads through this trait.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use blobstream_common::{IngestError, Result};

pub mod http;

pub use http::HttpBlobStore;

/// Identifies one remote object at discovery time.
///
/// Immutable once fetched; a changed etag on re-visit invalidates any saved
/// offset for the object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectHandle {
    pub bucket: String,
    pub key: String,
    /// Declared size in bytes
    pub size: u64,
    /// Content fingerprint reported by the store
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub storage_class: Option<String>,
}

impl ObjectHandle {
    pub fn uri(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }
}

/// Body stream handed out by a store. The caller owns it exclusively and
/// drops it to close the connection.
pub type ObjectBody = Box<dyn Read + Send>;

/// Client interface to a remote blob store.
pub trait RemoteStore: Send + Sync {
    /// List objects under `prefix` modified at or after `since`.
    fn list(
        &self,
        bucket: &str,
        prefix: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ObjectHandle>>;

    /// Fetch current metadata for one object.
    fn head(&self, bucket: &str, key: &str) -> Result<ObjectHandle>;

    /// Open the object body starting at byte `start`.
    fn get(&self, bucket: &str, key: &str, start: u64) -> Result<(ObjectBody, ObjectHandle)>;
}

/// In-memory store for tests and embedded use
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
}

struct StoredObject {
    data: Vec<u8>,
    etag: Option<String>,
    last_modified: Option<DateTime<Utc>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, key: &str, data: Vec<u8>, etag: Option<&str>) {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data,
                etag: etag.map(String::from),
                last_modified: Some(Utc::now()),
            },
        );
    }

    pub fn remove(&self, bucket: &str, key: &str) {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.remove(&(bucket.to_string(), key.to_string()));
    }

    fn handle_for(&self, bucket: &str, key: &str, object: &StoredObject) -> ObjectHandle {
        ObjectHandle {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: object.data.len() as u64,
            etag: object.etag.clone(),
            last_modified: object.last_modified,
            storage_class: None,
        }
    }
}

impl RemoteStore for MemoryBlobStore {
    fn list(
        &self,
        bucket: &str,
        prefix: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ObjectHandle>> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let mut handles: Vec<ObjectHandle> = objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .filter(|(_, o)| match (since, o.last_modified) {
                (Some(since), Some(modified)) => modified >= since,
                _ => true,
            })
            .map(|((b, k), o)| self.handle_for(b, k, o))
            .collect();
        handles.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(handles)
    }

    fn head(&self, bucket: &str, key: &str) -> Result<ObjectHandle> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let object = objects.get(&(bucket.to_string(), key.to_string())).ok_or_else(|| {
            IngestError::ObjectUnavailable {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }
        })?;
        Ok(self.handle_for(bucket, key, object))
    }

    fn get(&self, bucket: &str, key: &str, start: u64) -> Result<(ObjectBody, ObjectHandle)> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let object = objects.get(&(bucket.to_string(), key.to_string())).ok_or_else(|| {
            IngestError::ObjectUnavailable {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }
        })?;
        let handle = self.handle_for(bucket, key, object);
        let start = (start as usize).min(object.data.len());
        let body = Cursor::new(object.data[start..].to_vec());
        Ok((Box::new(body), handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_ranged_get() {
        let store = MemoryBlobStore::new();
        store.put("logs", "a.txt", b"hello world".to_vec(), Some("e1"));

        let (mut body, handle) = store.get("logs", "a.txt", 6).expect("get failed");
        let mut data = Vec::new();
        body.read_to_end(&mut data).expect("read failed");
        assert_eq!(data, b"world");
        assert_eq!(handle.size, 11);
        assert_eq!(handle.etag.as_deref(), Some("e1"));
    }

    #[test]
    fn test_memory_store_missing_object_is_unavailable() {
        let store = MemoryBlobStore::new();
        let err = store.head("logs", "missing").unwrap_err();
        assert!(err.is_object_unavailable());
    }

    #[test]
    fn test_memory_store_list_by_prefix() {
        let store = MemoryBlobStore::new();
        store.put("logs", "2024/a.txt", vec![1], None);
        store.put("logs", "2024/b.txt", vec![2], None);
        store.put("logs", "2023/c.txt", vec![3], None);

        let handles = store.list("logs", "2024/", None).expect("list failed");
        let keys: Vec<&str> = handles.iter().map(|h| h.key.as_str()).collect();
        assert_eq!(keys, vec!["2024/a.txt", "2024/b.txt"]);
    }
}
