//! Bulk object processing
//!
//! Some objects are only meaningful as a single parsed document: a JSON
//! container whose records can be extracted only after the whole object is
//! read. The bulk processor reads to exhaustion, parses once, emits one event
//! per record, and commits a single end-of-object checkpoint. There is no
//! partial-progress commit; a crash mid-parse re-processes the whole object
//! on restart, which is acceptable because the format cannot be partially
//! parsed safely.

use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use blobstream_common::{IngestError, Result};

use crate::cancel::StopFlag;
use crate::checkpoint::{CheckpointStore, ObjectCheckpoint, ProcessingState};
use crate::config::IngestConfig;
use crate::decode::ArchiveDecoder;
use crate::sink::{EventSink, SinkEvent};
use crate::store::{ObjectHandle, RemoteStore};

use super::ProcessOutcome;

/// How the parsed document maps to records
#[derive(Debug, Clone)]
pub struct BulkParseConfig {
    /// Document field holding the record array when the root is an object;
    /// a root-level array is used as-is
    pub records_field: String,
    /// Record field the denylist is matched against
    pub deny_field: Option<String>,
    /// Records whose `deny_field` value matches are dropped before emission
    pub denylist: Option<Regex>,
}

impl Default for BulkParseConfig {
    fn default() -> Self {
        Self {
            records_field: "Records".to_string(),
            deny_field: None,
            denylist: None,
        }
    }
}

/// Whole-document processor for record containers.
pub struct BulkObjectProcessor {
    store: Arc<dyn RemoteStore>,
    checkpoints: Arc<CheckpointStore>,
    sink: Arc<dyn EventSink>,
    config: IngestConfig,
    parse: BulkParseConfig,
}

impl BulkObjectProcessor {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        checkpoints: Arc<CheckpointStore>,
        sink: Arc<dyn EventSink>,
        config: IngestConfig,
        parse: BulkParseConfig,
    ) -> Self {
        Self {
            store,
            checkpoints,
            sink,
            config,
            parse,
        }
    }

    /// Process one record-container object from start to finish.
    pub fn process(&mut self, object: &ObjectHandle, stop: &StopFlag) -> Result<ProcessOutcome> {
        if !self.config.should_process(&object.key) {
            debug!(bucket = %object.bucket, key = %object.key, "Key filtered, skipping");
            return Ok(ProcessOutcome::Skipped);
        }

        let mut checkpoint = self
            .checkpoints
            .get_object(&object.bucket, &object.key)?
            .unwrap_or_else(|| ObjectCheckpoint::new(object.key.clone()));

        if checkpoint.etag != object.etag {
            checkpoint.reset_for_etag(object.etag.clone());
        }
        checkpoint.last_modified = object.last_modified;

        if checkpoint.eof {
            self.checkpoints.delete_object(&object.bucket, &object.key)?;
            return Ok(ProcessOutcome::Skipped);
        }

        match self.run(object, &mut checkpoint, stop) {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_object_unavailable() => {
                warn!(
                    bucket = %object.bucket,
                    key = %object.key,
                    "Object vanished, dropping checkpoint"
                );
                self.checkpoints.delete_object(&object.bucket, &object.key)?;
                Ok(ProcessOutcome::Skipped)
            },
            Err(e) => self.record_failure(object, &mut checkpoint, e),
        }
    }

    fn run(
        &mut self,
        object: &ObjectHandle,
        checkpoint: &mut ObjectCheckpoint,
        stop: &StopFlag,
    ) -> Result<ProcessOutcome> {
        let mut decoder = ArchiveDecoder::for_object(self.store.clone(), object, &self.config, 0)?;

        let mut document = Vec::with_capacity(object.size as usize);
        loop {
            if stop.is_stopped() {
                info!(
                    bucket = %object.bucket,
                    key = %object.key,
                    "Stopped by cancellation before parse"
                );
                return Ok(ProcessOutcome::Interrupted);
            }
            let Some(frame) = decoder.next_frame()? else {
                break;
            };
            document.extend_from_slice(&frame.bytes);
        }

        let parsed: Value = serde_json::from_slice(&document)
            .map_err(|e| IngestError::Parse(format!("Malformed record container: {}", e)))?;
        let records = match &parsed {
            Value::Array(records) => records.as_slice(),
            Value::Object(map) => map
                .get(&self.parse.records_field)
                .and_then(Value::as_array)
                .map(|records| records.as_slice())
                .ok_or_else(|| {
                    IngestError::Parse(format!(
                        "Record container has no \"{}\" array",
                        self.parse.records_field
                    ))
                })?,
            _ => {
                return Err(IngestError::Parse(
                    "Record container is neither an array nor an object".to_string(),
                ))
            },
        };

        let mut emitted = 0u64;
        let mut denied = 0u64;
        for record in records {
            if self.is_denied(record) {
                denied += 1;
                continue;
            }
            self.sink.write_event(SinkEvent {
                data: serde_json::to_vec(record)?,
                source: object.uri(),
                sourcetype: self.config.sourcetype.clone(),
                index: self.config.index.clone(),
                unbroken: false,
                done: false,
            })?;
            emitted += 1;
        }
        self.sink.write_event(SinkEvent {
            data: Vec::new(),
            source: object.uri(),
            sourcetype: self.config.sourcetype.clone(),
            index: self.config.index.clone(),
            unbroken: true,
            done: true,
        })?;

        checkpoint.offset = decoder.position();
        checkpoint.eof = true;
        checkpoint.state = ProcessingState::Processing;
        self.checkpoints.save_object(&object.bucket, checkpoint)?;
        self.checkpoints.delete_object(&object.bucket, &object.key)?;

        info!(
            bucket = %object.bucket,
            key = %object.key,
            records = emitted,
            denied,
            "Object fully indexed"
        );
        Ok(ProcessOutcome::Indexed)
    }

    fn is_denied(&self, record: &Value) -> bool {
        let (Some(field), Some(deny)) = (&self.parse.deny_field, &self.parse.denylist) else {
            return false;
        };
        record
            .get(field)
            .and_then(Value::as_str)
            .map_or(false, |value| deny.is_match(value))
    }

    /// Same give-up policy as the streaming processor: once the retry limit
    /// is crossed the checkpoint is deleted and the object abandoned.
    fn record_failure(
        &mut self,
        object: &ObjectHandle,
        checkpoint: &mut ObjectCheckpoint,
        err: IngestError,
    ) -> Result<ProcessOutcome> {
        checkpoint.error_count += 1;
        checkpoint.state = ProcessingState::Failed;

        if self.config.retry_limit.exhausted(checkpoint.error_count) {
            error!(
                bucket = %object.bucket,
                key = %object.key,
                error = %err,
                error_count = checkpoint.error_count,
                "Retry limit crossed, abandoning object"
            );
            self.checkpoints.delete_object(&object.bucket, &object.key)?;
            Ok(ProcessOutcome::GivenUp)
        } else {
            warn!(
                bucket = %object.bucket,
                key = %object.key,
                error = %err,
                error_count = checkpoint.error_count,
                "Object processing failed, will retry"
            );
            self.checkpoints.save_object(&object.bucket, checkpoint)?;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryBackend;
    use crate::config::RetryLimit;
    use crate::sink::MemorySink;
    use crate::store::{MemoryBlobStore, RemoteStore};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::json;
    use std::io::Write;

    struct Fixture {
        store: Arc<MemoryBlobStore>,
        checkpoints: Arc<CheckpointStore>,
        sink: Arc<MemorySink>,
    }

    fn fixture() -> Fixture {
        Fixture {
            store: Arc::new(MemoryBlobStore::new()),
            checkpoints: Arc::new(CheckpointStore::new(Box::new(MemoryBackend::new()))),
            sink: Arc::new(MemorySink::new()),
        }
    }

    fn processor(fixture: &Fixture, config: IngestConfig, parse: BulkParseConfig) -> BulkObjectProcessor {
        BulkObjectProcessor::new(
            fixture.store.clone(),
            fixture.checkpoints.clone(),
            fixture.sink.clone(),
            config,
            parse,
        )
    }

    fn container() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "Records": [
                {"eventName": "PutObject", "key": "a"},
                {"eventName": "DescribeInstances", "key": "b"},
                {"eventName": "DeleteObject", "key": "c"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_emits_one_event_per_record() {
        let f = fixture();
        f.store.put("trail", "day1.json", container(), Some("e1"));
        let object = f.store.head("trail", "day1.json").expect("head");

        let mut processor = processor(&f, IngestConfig::default(), BulkParseConfig::default());
        let outcome = processor.process(&object, &StopFlag::new()).expect("process");
        assert_eq!(outcome, ProcessOutcome::Indexed);

        let payloads = f.sink.payloads();
        assert_eq!(payloads.len(), 3);
        let first: Value = serde_json::from_slice(&payloads[0]).expect("json");
        assert_eq!(first["eventName"], "PutObject");

        let events = f.sink.events();
        assert!(events.last().expect("events").done);
        // nothing left to resume
        assert!(f
            .checkpoints
            .get_object("trail", "day1.json")
            .expect("get")
            .is_none());
    }

    #[test]
    fn test_denylist_drops_matching_records() {
        let f = fixture();
        f.store.put("trail", "day1.json", container(), Some("e1"));
        let object = f.store.head("trail", "day1.json").expect("head");

        let parse = BulkParseConfig {
            deny_field: Some("eventName".to_string()),
            denylist: Some(Regex::new(r"^Describe").unwrap()),
            ..Default::default()
        };
        let mut processor = processor(&f, IngestConfig::default(), parse);
        processor.process(&object, &StopFlag::new()).expect("process");

        let payloads = f.sink.payloads();
        assert_eq!(payloads.len(), 2);
        for payload in payloads {
            let record: Value = serde_json::from_slice(&payload).expect("json");
            assert_ne!(record["eventName"], "DescribeInstances");
        }
    }

    #[test]
    fn test_root_level_array_container() {
        let f = fixture();
        let data = serde_json::to_vec(&json!([{"id": 1}, {"id": 2}])).unwrap();
        f.store.put("trail", "flat.json", data, Some("e1"));
        let object = f.store.head("trail", "flat.json").expect("head");

        let mut processor = processor(&f, IngestConfig::default(), BulkParseConfig::default());
        let outcome = processor.process(&object, &StopFlag::new()).expect("process");
        assert_eq!(outcome, ProcessOutcome::Indexed);
        assert_eq!(f.sink.payloads().len(), 2);
    }

    #[test]
    fn test_gzipped_container_is_unwrapped() {
        let f = fixture();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&container()).unwrap();
        f.store
            .put("trail", "day1.json.gz", encoder.finish().unwrap(), Some("e1"));
        let object = f.store.head("trail", "day1.json.gz").expect("head");

        let mut processor = processor(&f, IngestConfig::default(), BulkParseConfig::default());
        let outcome = processor.process(&object, &StopFlag::new()).expect("process");
        assert_eq!(outcome, ProcessOutcome::Indexed);
        assert_eq!(f.sink.payloads().len(), 3);
    }

    #[test]
    fn test_malformed_container_crosses_retry_limit() {
        let f = fixture();
        f.store
            .put("trail", "broken.json", b"{not valid json".to_vec(), Some("e1"));
        let object = f.store.head("trail", "broken.json").expect("head");

        let config = IngestConfig {
            retry_limit: RetryLimit::Bounded(2),
            ..Default::default()
        };
        let mut processor = processor(&f, config, BulkParseConfig::default());

        let err = processor.process(&object, &StopFlag::new()).unwrap_err();
        assert!(matches!(err, IngestError::Parse(_)));
        let saved = f
            .checkpoints
            .get_object("trail", "broken.json")
            .expect("get")
            .expect("present");
        assert_eq!(saved.error_count, 1);
        assert_eq!(saved.state, ProcessingState::Failed);

        let outcome = processor.process(&object, &StopFlag::new()).expect("second pass");
        assert_eq!(outcome, ProcessOutcome::GivenUp);
        assert!(f
            .checkpoints
            .get_object("trail", "broken.json")
            .expect("get")
            .is_none());
        assert!(f.sink.payloads().is_empty());
    }

    #[test]
    fn test_stop_flag_interrupts_without_commit() {
        let f = fixture();
        f.store.put("trail", "day1.json", container(), Some("e1"));
        let object = f.store.head("trail", "day1.json").expect("head");

        let stop = StopFlag::new();
        stop.stop();
        let mut processor = processor(&f, IngestConfig::default(), BulkParseConfig::default());
        let outcome = processor.process(&object, &stop).expect("process");
        assert_eq!(outcome, ProcessOutcome::Interrupted);
        assert!(f.sink.events().is_empty());
        assert!(f
            .checkpoints
            .get_object("trail", "day1.json")
            .expect("get")
            .is_none());
    }
}
