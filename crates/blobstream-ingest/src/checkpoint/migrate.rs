//! One-time migration of legacy file checkpoints
//!
//! Older collectors kept per-bucket progress in a local JSON file. On first
//! touch of a bucket the file's entries are translated into checkpoint
//! records; a completion marker prevents repeat translation.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use blobstream_common::{keyhash, IngestError, Result};

use super::{BucketIndexCheckpoint, CheckpointStore, ObjectCheckpoint, ProcessingState};

/// Per-key progress tuple in the legacy format
#[derive(Debug, Deserialize)]
pub struct LegacyEntry {
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub offset: u64,
    pub eof: bool,
    #[serde(default)]
    pub error_count: u32,
}

#[derive(Debug, Deserialize)]
struct LegacyBucketFile {
    keys: HashMap<String, LegacyEntry>,
}

/// Backend key for a bucket's migration-completion marker
pub fn migration_marker_key(bucket: &str) -> String {
    keyhash::derive_key("migrated", bucket)
}

/// Translate a legacy checkpoint file into checkpoint records.
///
/// Returns the number of object records written; 0 when the marker already
/// exists or no legacy file is present. The marker is written either way so
/// the path is never re-examined for this bucket.
pub fn migrate_legacy_checkpoints(
    path: &Path,
    bucket: &str,
    store: &CheckpointStore,
) -> Result<u64> {
    let marker_key = migration_marker_key(bucket);
    if store.get_raw(&marker_key)?.is_some() {
        debug!(bucket, "Legacy checkpoint migration already completed");
        return Ok(0);
    }

    let mut migrated = 0u64;
    if path.exists() {
        let raw = fs::read_to_string(path)?;
        let legacy: LegacyBucketFile = serde_json::from_str(&raw).map_err(|e| {
            IngestError::Parse(format!(
                "Malformed legacy checkpoint file {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut index = BucketIndexCheckpoint::new(bucket);
        for (key, entry) in legacy.keys {
            let checkpoint = ObjectCheckpoint {
                key: key.clone(),
                etag: entry.etag,
                last_modified: entry.last_modified,
                offset: entry.offset,
                eof: entry.eof,
                error_count: entry.error_count,
                encoding: None,
                csv_header: None,
                state: if entry.offset > 0 {
                    ProcessingState::Processing
                } else {
                    ProcessingState::New
                },
            };
            store.save_object(bucket, &checkpoint)?;
            index.observe(&key, entry.last_modified);
            migrated += 1;
        }
        store.save_bucket_index(&index)?;
        info!(bucket, migrated, "Migrated legacy checkpoint file");
    }

    store.put_raw(&marker_key, json!({ "bucket": bucket, "entries": migrated }))?;
    Ok(migrated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryBackend;
    use std::io::Write;

    fn legacy_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("logs.checkpoint.json");
        let mut file = fs::File::create(&path).expect("create");
        file.write_all(
            br#"{
                "keys": {
                    "2024/app.gz": {
                        "etag": "e1",
                        "last_modified": "2026-08-01T12:00:00Z",
                        "offset": 4096,
                        "eof": false
                    },
                    "2024/done.gz": {
                        "etag": "e2",
                        "last_modified": "2026-08-02T12:00:00Z",
                        "offset": 100,
                        "eof": true,
                        "error_count": 1
                    }
                }
            }"#,
        )
        .expect("write");
        path
    }

    #[test]
    fn test_migration_translates_entries_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = legacy_file(&dir);
        let store = CheckpointStore::new(Box::new(MemoryBackend::new()));

        let migrated = migrate_legacy_checkpoints(&path, "logs", &store).expect("migrate");
        assert_eq!(migrated, 2);

        let checkpoint = store
            .get_object("logs", "2024/app.gz")
            .expect("get")
            .expect("present");
        assert_eq!(checkpoint.etag.as_deref(), Some("e1"));
        assert_eq!(checkpoint.offset, 4096);
        assert!(!checkpoint.eof);
        assert_eq!(checkpoint.state, ProcessingState::Processing);

        let done = store
            .get_object("logs", "2024/done.gz")
            .expect("get")
            .expect("present");
        assert!(done.eof);
        assert_eq!(done.error_count, 1);

        let index = store
            .get_bucket_index("logs")
            .expect("get")
            .expect("present");
        assert_eq!(index.keys.len(), 2);
        assert_eq!(
            index.latest_last_modified,
            Some("2026-08-02T12:00:00Z".parse().unwrap())
        );

        // second touch is a no-op thanks to the completion marker
        let again = migrate_legacy_checkpoints(&path, "logs", &store).expect("migrate");
        assert_eq!(again, 0);
    }

    #[test]
    fn test_missing_file_still_writes_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.json");
        let store = CheckpointStore::new(Box::new(MemoryBackend::new()));

        assert_eq!(
            migrate_legacy_checkpoints(&path, "logs", &store).expect("migrate"),
            0
        );
        assert!(store
            .get_raw(&migration_marker_key("logs"))
            .expect("get")
            .is_some());
    }
}
