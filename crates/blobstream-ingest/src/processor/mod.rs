//! Object processing state machine
//!
//! One processor drives one object at a time through
//! Fresh → Seeking → Streaming → Committing → {Indexed | Failed},
//! committing byte-accurate progress while it streams. The processor is the
//! only writer to the checkpoint of the object it is processing.

pub mod bulk;

pub use bulk::BulkObjectProcessor;

use std::sync::Arc;

use encoding_rs::Encoding;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use blobstream_common::{IngestError, Result};

use crate::cancel::StopFlag;
use crate::checkpoint::{CheckpointStore, ObjectCheckpoint, ProcessingState};
use crate::config::{CharacterSet, IngestConfig};
use crate::decode::{ArchiveDecoder, ChunkFrame};
use crate::sink::{EventSink, SinkEvent};
use crate::store::{ObjectHandle, RemoteStore};
use crate::text::{LineAssembler, TextDecoder};

/// Processing phase for one pass over an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fresh,
    Seeking,
    Streaming,
    Committing,
    Indexed,
    Failed,
}

/// Outcome of one processing pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// End of stream reached; eof committed and the checkpoint deleted
    Indexed,
    /// Stop flag observed; progress committed and the stream closed
    Interrupted,
    /// Nothing to do: filtered key, vanished object, or already indexed
    Skipped,
    /// The retry limit was crossed; the checkpoint was dropped and the
    /// object abandoned
    GivenUp,
}

struct CsvState {
    lines: LineAssembler,
    headers: Option<Vec<String>>,
    lines_seen: u64,
    rows_emitted: u64,
}

impl CsvState {
    fn new() -> Self {
        Self {
            lines: LineAssembler::new(),
            headers: None,
            lines_seen: 0,
            rows_emitted: 0,
        }
    }

    fn reset_member(&mut self) {
        self.headers = None;
        self.lines_seen = 0;
        self.rows_emitted = 0;
    }
}

/// Streaming processor for one object at a time.
pub struct ObjectProcessor {
    store: Arc<dyn RemoteStore>,
    checkpoints: Arc<CheckpointStore>,
    sink: Arc<dyn EventSink>,
    config: IngestConfig,
    phase: Phase,
}

impl ObjectProcessor {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        checkpoints: Arc<CheckpointStore>,
        sink: Arc<dyn EventSink>,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            checkpoints,
            sink,
            config,
            phase: Phase::Fresh,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Process one object, resuming from its checkpoint if one exists.
    pub fn process(&mut self, object: &ObjectHandle, stop: &StopFlag) -> Result<ProcessOutcome> {
        self.phase = Phase::Fresh;

        if !self.config.should_process(&object.key) {
            debug!(bucket = %object.bucket, key = %object.key, "Key filtered, skipping");
            return Ok(ProcessOutcome::Skipped);
        }

        let mut checkpoint = self
            .checkpoints
            .get_object(&object.bucket, &object.key)?
            .unwrap_or_else(|| ObjectCheckpoint::new(object.key.clone()));

        if checkpoint.etag != object.etag {
            if checkpoint.offset > 0 || checkpoint.eof {
                info!(
                    bucket = %object.bucket,
                    key = %object.key,
                    "Object rewritten under checkpoint, restarting from offset 0"
                );
            }
            checkpoint.reset_for_etag(object.etag.clone());
        }
        checkpoint.last_modified = object.last_modified;

        if checkpoint.eof {
            // fully indexed in an earlier pass; nothing left to resume
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

    /// Record a failed pass, enforcing the give-up policy: once the retry
    /// limit is crossed the checkpoint is deleted outright and the object
    /// abandoned, trading completeness for pipeline liveness.
    fn record_failure(
        &mut self,
        object: &ObjectHandle,
        checkpoint: &mut ObjectCheckpoint,
        err: IngestError,
    ) -> Result<ProcessOutcome> {
        self.phase = Phase::Failed;
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

    fn run(
        &mut self,
        object: &ObjectHandle,
        checkpoint: &mut ObjectCheckpoint,
        stop: &StopFlag,
    ) -> Result<ProcessOutcome> {
        let mut decoder =
            ArchiveDecoder::for_object(self.store.clone(), object, &self.config, checkpoint.offset)?;

        self.phase = Phase::Seeking;
        if checkpoint.offset > 0 {
            decoder.seek(checkpoint.offset)?;
            debug!(
                bucket = %object.bucket,
                key = %object.key,
                offset = checkpoint.offset,
                "Resumed at checkpointed offset"
            );
        }

        self.phase = Phase::Streaming;

        let object_start = checkpoint.offset == 0;
        let mut text: Option<TextDecoder> = match &self.config.character_set {
            CharacterSet::Named(label) => Some(TextDecoder::for_label(label)?),
            CharacterSet::Auto => match &checkpoint.encoding {
                Some(name) => Some(TextDecoder::for_label(name)?),
                None => None,
            },
        };
        if let Some(ref decoder) = text {
            checkpoint.encoding = Some(decoder.name().to_string());
        }

        let mut csv = if self.config.parse_csv_with_header {
            let mut state = CsvState::new();
            if checkpoint.offset > 0 {
                // header of the member the resume lands in, captured before
                // the crash
                state.headers = checkpoint.csv_header.clone();
            }
            Some(state)
        } else {
            None
        };
        let mut member: Option<String> = None;
        let mut consumed = checkpoint.offset;
        let mut last_committed = checkpoint.offset;
        let mut chunks_since_commit = 0u64;
        let mut first_frame = true;
        let mut replacement_logged = false;

        loop {
            if stop.is_stopped() {
                let pending = csv.as_ref().map_or(0, |c| c.lines.pending() as u64);
                self.phase = Phase::Committing;
                self.commit(object, checkpoint, consumed - pending, csv.as_ref(), &mut last_committed);
                info!(
                    bucket = %object.bucket,
                    key = %object.key,
                    offset = last_committed,
                    "Stopped by cancellation"
                );
                return Ok(ProcessOutcome::Interrupted);
            }

            let Some(frame) = decoder.next_frame()? else {
                break;
            };
            let ChunkFrame { mut bytes, member_path } = frame;
            consumed += bytes.len() as u64;

            if member.as_deref() != Some(member_path.as_str()) {
                if let Some(finished) = member.take() {
                    self.finish_member(&finished, csv.as_mut(), text.as_ref(), object)?;
                }
                debug!(member = %member_path, "Entering member");
                member = Some(member_path);
            }

            if text.is_none() {
                let detected = TextDecoder::detect(&bytes);
                debug!(
                    bucket = %object.bucket,
                    key = %object.key,
                    encoding = detected.name(),
                    "Detected character set"
                );
                checkpoint.encoding = Some(detected.name().to_string());
                text = Some(detected);
            }

            if first_frame {
                if object_start && csv.is_some() {
                    // the stateful decoder strips the BOM itself; raw-byte
                    // line parsing has to drop it here
                    if let Some((_, bom_len)) = Encoding::for_bom(&bytes) {
                        bytes.drain(..bom_len);
                    }
                }
                first_frame = false;
            }

            match csv.as_mut() {
                Some(csv_state) => {
                    for line in csv_state.lines.push(&bytes) {
                        self.emit_csv_line(csv_state, text.as_ref(), &line, member.as_deref(), object)?;
                    }
                },
                None => {
                    if let Some(decoder) = text.as_mut() {
                        let (decoded, replaced) = decoder.decode_chunk(&bytes, false);
                        if replaced && !replacement_logged {
                            warn!(
                                bucket = %object.bucket,
                                key = %object.key,
                                encoding = decoder.name(),
                                "Malformed input replaced during decode"
                            );
                            replacement_logged = true;
                        }
                        if !decoded.is_empty() {
                            self.emit(object, member.as_deref(), decoded.into_bytes(), true, false)?;
                        }
                    }
                },
            }

            chunks_since_commit += 1;
            if chunks_since_commit >= self.config.commit_interval {
                let pending = csv.as_ref().map_or(0, |c| c.lines.pending() as u64);
                self.phase = Phase::Committing;
                self.commit(object, checkpoint, consumed - pending, csv.as_ref(), &mut last_committed);
                self.phase = Phase::Streaming;
                chunks_since_commit = 0;
            }
        }

        // end of stream: flush tails and close out the checkpoint
        if let Some(finished) = member.take() {
            self.finish_member(&finished, csv.as_mut(), text.as_ref(), object)?;
        }
        if csv.is_none() {
            if let Some(decoder) = text.as_mut() {
                let (tail, _) = decoder.decode_chunk(&[], true);
                if !tail.is_empty() {
                    self.emit(object, None, tail.into_bytes(), true, false)?;
                }
            }
        }
        self.emit(object, None, Vec::new(), true, true)?;

        self.phase = Phase::Committing;
        checkpoint.offset = consumed;
        checkpoint.eof = true;
        checkpoint.state = ProcessingState::Processing;
        self.checkpoints.save_object(&object.bucket, checkpoint)?;
        self.checkpoints.delete_object(&object.bucket, &object.key)?;

        self.phase = Phase::Indexed;
        info!(
            bucket = %object.bucket,
            key = %object.key,
            bytes = consumed,
            "Object fully indexed"
        );
        Ok(ProcessOutcome::Indexed)
    }

    /// Flush the trailing line of a finished member and log its summary
    fn finish_member(
        &self,
        finished: &str,
        csv: Option<&mut CsvState>,
        text: Option<&TextDecoder>,
        object: &ObjectHandle,
    ) -> Result<()> {
        let Some(csv_state) = csv else {
            return Ok(());
        };
        if let Some(line) = csv_state.lines.flush() {
            self.emit_csv_line(csv_state, text, &line, Some(finished), object)?;
        }
        info!(
            member = %finished,
            lines = csv_state.lines_seen,
            rows = csv_state.rows_emitted,
            "Finished parsing member"
        );
        csv_state.reset_member();
        Ok(())
    }

    fn emit_csv_line(
        &self,
        csv_state: &mut CsvState,
        text: Option<&TextDecoder>,
        line: &[u8],
        member: Option<&str>,
        object: &ObjectHandle,
    ) -> Result<()> {
        if line.is_empty() {
            return Ok(());
        }
        csv_state.lines_seen += 1;

        let decoded = match text {
            Some(decoder) => decoder.decode_line(line),
            None => String::from_utf8_lossy(line).into_owned(),
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .delimiter(self.config.csv_delimiter)
            .from_reader(decoded.as_bytes());

        let record = match reader.records().next() {
            None => return Ok(()),
            Some(Err(e)) => {
                warn!(member = ?member, error = %e, "Skipping malformed CSV line");
                return Ok(());
            },
            Some(Ok(record)) => record,
        };

        match csv_state.headers.as_ref() {
            None => {
                csv_state.headers = Some(record.iter().map(String::from).collect());
            },
            Some(headers) => {
                let mut row = serde_json::Map::new();
                for (i, field) in record.iter().enumerate() {
                    let name = headers
                        .get(i)
                        .cloned()
                        .unwrap_or_else(|| format!("field_{}", i + 1));
                    row.insert(name, Value::String(field.to_string()));
                }
                let payload = serde_json::to_vec(&Value::Object(row))?;
                self.emit(object, member, payload, false, false)?;
                csv_state.rows_emitted += 1;
            },
        }
        Ok(())
    }

    fn emit(
        &self,
        object: &ObjectHandle,
        member: Option<&str>,
        data: Vec<u8>,
        unbroken: bool,
        done: bool,
    ) -> Result<()> {
        let source = match member {
            Some(member) if member != object.key => format!("{}:{}", object.uri(), member),
            _ => object.uri(),
        };
        self.sink.write_event(SinkEvent {
            data,
            source,
            sourcetype: self.config.sourcetype.clone(),
            index: self.config.index.clone(),
            unbroken,
            done,
        })
    }

    /// Periodic commit. A failed write never advances the recorded offset;
    /// the commit is re-attempted at the next interval.
    fn commit(
        &self,
        object: &ObjectHandle,
        checkpoint: &mut ObjectCheckpoint,
        offset: u64,
        csv: Option<&CsvState>,
        last_committed: &mut u64,
    ) {
        let offset = offset.max(*last_committed);
        let previous_header = checkpoint.csv_header.clone();
        checkpoint.offset = offset;
        checkpoint.csv_header = csv.and_then(|state| state.headers.clone());
        checkpoint.state = ProcessingState::Processing;
        match self.checkpoints.save_object(&object.bucket, checkpoint) {
            Ok(()) => *last_committed = offset,
            Err(e) => {
                warn!(
                    bucket = %object.bucket,
                    key = %object.key,
                    error = %e,
                    "Checkpoint commit failed, keeping previous offset"
                );
                checkpoint.offset = *last_committed;
                checkpoint.csv_header = previous_header;
            },
        }
    }
}
