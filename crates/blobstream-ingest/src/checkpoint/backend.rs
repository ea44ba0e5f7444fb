//! Checkpoint persistence backend

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use blobstream_common::Result;

/// Key/value collection holding checkpoint records as JSON documents.
///
/// The backing store is typically a remote service; callers wrap every call
/// in a bounded retry. Concurrent access is safe as long as writers own
/// disjoint keys, which the scheduler guarantees per object.
pub trait CheckpointBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Idempotent upsert
    fn put(&self, key: &str, value: Value) -> Result<()>;

    /// Deleting an absent key is not an error
    fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory backend for tests and embedded use
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<String, Value>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CheckpointBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_backend_upsert_and_delete() {
        let backend = MemoryBackend::new();
        assert!(backend.get("k1").expect("get").is_none());

        backend.put("k1", json!({"offset": 1})).expect("put");
        backend.put("k1", json!({"offset": 2})).expect("put");
        assert_eq!(backend.get("k1").expect("get"), Some(json!({"offset": 2})));
        assert_eq!(backend.len(), 1);

        backend.delete("k1").expect("delete");
        backend.delete("k1").expect("delete is idempotent");
        assert!(backend.is_empty());
    }
}
