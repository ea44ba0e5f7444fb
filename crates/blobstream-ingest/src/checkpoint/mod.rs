//! Crash-safe progress checkpoints
//!
//! Two record families share one key/value collection: a per-object record
//! tracking byte-accurate progress, and a per-bucket index locating object
//! records by name. Records are cheap enough to upsert repeatedly during a
//! long transfer.

pub mod backend;
pub mod migrate;

pub use backend::{CheckpointBackend, MemoryBackend};

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use blobstream_common::{keyhash, IngestError, Result};

/// Attempts per backend call
const STORE_ATTEMPTS: u32 = 3;

/// Delay between attempts
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Per-object processing state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    New,
    Processing,
    Failed,
}

impl ProcessingState {
    pub fn as_str(&self) -> &str {
        match self {
            ProcessingState::New => "new",
            ProcessingState::Processing => "processing",
            ProcessingState::Failed => "failed",
        }
    }
}

/// Progress record for one (bucket, key).
///
/// `offset` only ever grows for a fixed etag; when the observed etag differs
/// from the stored one the object was rewritten and progress restarts. The
/// record is deleted once `eof` is committed, or force-deleted when
/// `error_count` crosses the configured retry limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectCheckpoint {
    pub key: String,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    /// Offset into the decoded byte stream, the domain decoder seeks operate in
    pub offset: u64,
    pub eof: bool,
    pub error_count: u32,
    /// Character set detected for this object, persisted after first sight
    pub encoding: Option<String>,
    /// Header row of the member being streamed, in CSV mode. A resume that
    /// lands mid-member would otherwise mistake the first data line for the
    /// header.
    #[serde(default)]
    pub csv_header: Option<Vec<String>>,
    pub state: ProcessingState,
}

impl ObjectCheckpoint {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            etag: None,
            last_modified: None,
            offset: 0,
            eof: false,
            error_count: 0,
            encoding: None,
            csv_header: None,
            state: ProcessingState::New,
        }
    }

    /// Drop saved progress after the object was rewritten under the checkpoint
    pub fn reset_for_etag(&mut self, etag: Option<String>) {
        self.etag = etag;
        self.offset = 0;
        self.eof = false;
        self.encoding = None;
        self.csv_header = None;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyIndexEntry {
    /// Backend key of the object's checkpoint record
    pub checkpoint_key: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Discovery index for one collection task.
///
/// Written by the listing collaborator; the modification cursor bounds how
/// far back re-listing must search, and the key map locates each object's
/// checkpoint record without re-deriving its key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketIndexCheckpoint {
    pub bucket_name: String,
    pub latest_last_modified: Option<DateTime<Utc>>,
    pub keys: HashMap<String, KeyIndexEntry>,
}

impl BucketIndexCheckpoint {
    pub fn new(bucket_name: impl Into<String>) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            latest_last_modified: None,
            keys: HashMap::new(),
        }
    }

    /// Record a discovered key, advancing the modification cursor
    pub fn observe(&mut self, key: &str, last_modified: Option<DateTime<Utc>>) {
        self.keys.insert(
            key.to_string(),
            KeyIndexEntry {
                checkpoint_key: object_record_key(&self.bucket_name, key),
                last_modified,
            },
        );
        if let Some(modified) = last_modified {
            if self.latest_last_modified.map_or(true, |cursor| modified > cursor) {
                self.latest_last_modified = Some(modified);
            }
        }
    }
}

/// Backend key for an object's checkpoint record
pub fn object_record_key(bucket: &str, key: &str) -> String {
    keyhash::derive_key("obj", &format!("{}/{}", bucket, key))
}

/// Backend key for a bucket's index record
pub fn bucket_record_key(bucket: &str) -> String {
    keyhash::derive_key("bucket", bucket)
}

/// Typed access to checkpoint records with a bounded retry around every
/// backend call.
pub struct CheckpointStore {
    backend: Box<dyn CheckpointBackend>,
}

impl CheckpointStore {
    pub fn new(backend: Box<dyn CheckpointBackend>) -> Self {
        Self { backend }
    }

    pub fn get_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectCheckpoint>> {
        let record_key = object_record_key(bucket, key);
        let value = self.with_retry("get", &record_key, || self.backend.get(&record_key))?;
        value
            .map(|v| {
                serde_json::from_value(v).map_err(|e| {
                    IngestError::Checkpoint(format!("Corrupt object checkpoint {}: {}", record_key, e))
                })
            })
            .transpose()
    }

    /// Idempotent upsert of an object's progress
    pub fn save_object(&self, bucket: &str, checkpoint: &ObjectCheckpoint) -> Result<()> {
        let record_key = object_record_key(bucket, &checkpoint.key);
        let value = serde_json::to_value(checkpoint)?;
        self.with_retry("save", &record_key, || {
            self.backend.put(&record_key, value.clone())
        })
    }

    pub fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let record_key = object_record_key(bucket, key);
        self.with_retry("delete", &record_key, || self.backend.delete(&record_key))
    }

    pub fn get_bucket_index(&self, bucket: &str) -> Result<Option<BucketIndexCheckpoint>> {
        let record_key = bucket_record_key(bucket);
        let value = self.with_retry("get", &record_key, || self.backend.get(&record_key))?;
        value
            .map(|v| {
                serde_json::from_value(v).map_err(|e| {
                    IngestError::Checkpoint(format!("Corrupt bucket index {}: {}", record_key, e))
                })
            })
            .transpose()
    }

    pub fn save_bucket_index(&self, index: &BucketIndexCheckpoint) -> Result<()> {
        let record_key = bucket_record_key(&index.bucket_name);
        let value = serde_json::to_value(index)?;
        self.with_retry("save", &record_key, || {
            self.backend.put(&record_key, value.clone())
        })
    }

    pub(crate) fn get_raw(&self, record_key: &str) -> Result<Option<Value>> {
        self.with_retry("get", record_key, || self.backend.get(record_key))
    }

    pub(crate) fn put_raw(&self, record_key: &str, value: Value) -> Result<()> {
        self.with_retry("save", record_key, || {
            self.backend.put(record_key, value.clone())
        })
    }

    fn with_retry<T>(
        &self,
        action: &str,
        record_key: &str,
        mut call: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match call() {
                Ok(value) => return Ok(value),
                Err(e) if attempts < STORE_ATTEMPTS => {
                    warn!(
                        action,
                        record_key,
                        attempt = attempts,
                        error = %e,
                        "Checkpoint store call failed, retrying"
                    );
                    thread::sleep(RETRY_DELAY);
                },
                Err(e) => {
                    return Err(IngestError::Checkpoint(format!(
                        "{} {} failed after {} attempts: {}",
                        action, record_key, STORE_ATTEMPTS, e
                    )));
                },
            }
        }
    }
}
