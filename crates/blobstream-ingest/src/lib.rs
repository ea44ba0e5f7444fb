//! Blobstream Ingest Library
//!
//! Resumable streaming ingestion of remote blob-store objects.
//!
//! # Overview
//!
//! The engine fetches large objects over HTTP, transparently unwraps nested
//! archive/compression formats, decodes them into a byte-chunk stream, and
//! persists byte-accurate progress checkpoints so collection resumes from the
//! last indexed byte after a restart:
//!
//! - **Range Fetching**: pull-based ranged reads; a seek discards the
//!   connection and reopens at the target offset
//! - **Archive Decoding**: tar / gzip / zip / plain normalized into one
//!   frame iterator tagged with the logical sub-file each chunk belongs to
//! - **Checkpoints**: per-object progress records and per-bucket discovery
//!   indexes in a key/value backend, with legacy-file migration
//! - **Processing**: streaming and bulk processors driving decode, text
//!   conversion, CSV row parsing, and periodic checkpoint commits
//!
//! Credentials, bucket listing, cross-object scheduling, and the downstream
//! indexer are collaborators behind the `RemoteStore`, `CheckpointBackend`,
//! and `EventSink` traits.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use blobstream_ingest::cancel::StopFlag;
//! use blobstream_ingest::checkpoint::{CheckpointStore, MemoryBackend};
//! use blobstream_ingest::config::IngestConfig;
//! use blobstream_ingest::processor::ObjectProcessor;
//! use blobstream_ingest::sink::MemorySink;
//! use blobstream_ingest::store::{HttpBlobStore, RemoteStore};
//!
//! fn main() -> blobstream_common::Result<()> {
//!     let store = Arc::new(HttpBlobStore::new("https://blobs.example.com")?);
//!     let checkpoints = Arc::new(CheckpointStore::new(Box::new(MemoryBackend::new())));
//!     let sink = Arc::new(MemorySink::new());
//!
//!     let object = store.head("logs", "2026/08/app.log.gz")?;
//!     let mut processor =
//!         ObjectProcessor::new(store, checkpoints, sink, IngestConfig::default());
//!     processor.process(&object, &StopFlag::new())?;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod checkpoint;
pub mod config;
pub mod decode;
pub mod fetch;
pub mod processor;
pub mod sink;
pub mod store;
pub mod text;

pub use cancel::StopFlag;
pub use config::IngestConfig;
pub use processor::{BulkObjectProcessor, ObjectProcessor, ProcessOutcome};
