//! Pipeline tests against a mock HTTP blob endpoint

use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use httpmock::prelude::*;
use std::io::Write;

use blobstream_ingest::cancel::StopFlag;
use blobstream_ingest::checkpoint::{CheckpointStore, MemoryBackend, ObjectCheckpoint};
use blobstream_ingest::config::IngestConfig;
use blobstream_ingest::processor::{ObjectProcessor, ProcessOutcome};
use blobstream_ingest::sink::MemorySink;
use blobstream_ingest::store::{HttpBlobStore, RemoteStore};

fn checkpoints() -> Arc<CheckpointStore> {
    Arc::new(CheckpointStore::new(Box::new(MemoryBackend::new())))
}

fn gzip_bytes(content: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content).unwrap();
    encoder.finish().unwrap()
}

#[test]
fn test_gzip_object_ingested_over_http() {
    let content = b"line one\nline two\nline three\n".repeat(8);
    let compressed = gzip_bytes(&content);

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(HEAD).path("/logs/app.log.gz");
        then.status(200)
            .header("Content-Length", compressed.len().to_string())
            .header("ETag", "\"e1\"");
    });
    server.mock(|when, then| {
        when.method(GET).path("/logs/app.log.gz");
        then.status(200)
            .header("Content-Length", compressed.len().to_string())
            .header("ETag", "\"e1\"")
            .body(compressed.clone());
    });

    let store = Arc::new(HttpBlobStore::new(server.base_url()).expect("client"));
    let object = store.head("logs", "app.log.gz").expect("head");
    assert_eq!(object.etag.as_deref(), Some("e1"));

    let checkpoints = checkpoints();
    let sink = Arc::new(MemorySink::new());
    let mut processor = ObjectProcessor::new(
        store,
        checkpoints.clone(),
        sink.clone(),
        IngestConfig::default(),
    );
    let outcome = processor.process(&object, &StopFlag::new()).expect("process");
    assert_eq!(outcome, ProcessOutcome::Indexed);

    assert_eq!(sink.payloads().concat(), content);
    assert!(checkpoints
        .get_object("logs", "app.log.gz")
        .expect("get")
        .is_none());
}

#[test]
fn test_plain_resume_issues_ranged_request() {
    let content: Vec<u8> = (b'a'..=b'z').cycle().take(200).collect();

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(HEAD).path("/logs/big.txt");
        then.status(200)
            .header("Content-Length", "200")
            .header("ETag", "\"e1\"");
    });
    // only the resumed range is served; a read from byte zero would 404
    server.mock(|when, then| {
        when.method(GET)
            .path("/logs/big.txt")
            .header("range", "bytes=150-");
        then.status(206)
            .header("Content-Range", "bytes 150-199/200")
            .header("ETag", "\"e1\"")
            .body(content[150..].to_vec());
    });

    let store = Arc::new(HttpBlobStore::new(server.base_url()).expect("client"));
    let object = store.head("logs", "big.txt").expect("head");

    let checkpoints = checkpoints();
    let mut saved = ObjectCheckpoint::new("big.txt");
    saved.etag = Some("e1".to_string());
    saved.offset = 150;
    checkpoints.save_object("logs", &saved).expect("save");

    let sink = Arc::new(MemorySink::new());
    let config = IngestConfig {
        buffer_size: 64,
        force_streaming: true,
        ..Default::default()
    };
    let mut processor = ObjectProcessor::new(store, checkpoints.clone(), sink.clone(), config);
    let outcome = processor.process(&object, &StopFlag::new()).expect("process");
    assert_eq!(outcome, ProcessOutcome::Indexed);

    assert_eq!(sink.payloads().concat(), content[150..]);
    assert!(checkpoints.get_object("logs", "big.txt").expect("get").is_none());
}

#[test]
fn test_resume_at_end_completes_cleanly() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(HEAD).path("/logs/done.txt");
        then.status(200)
            .header("Content-Length", "200")
            .header("ETag", "\"e1\"");
    });
    server.mock(|when, then| {
        when.method(GET)
            .path("/logs/done.txt")
            .header("range", "bytes=200-");
        then.status(416).header("Content-Range", "bytes */200");
    });

    let store = Arc::new(HttpBlobStore::new(server.base_url()).expect("client"));
    let object = store.head("logs", "done.txt").expect("head");

    let checkpoints = checkpoints();
    let mut saved = ObjectCheckpoint::new("done.txt");
    saved.etag = Some("e1".to_string());
    saved.offset = 200;
    checkpoints.save_object("logs", &saved).expect("save");

    let sink = Arc::new(MemorySink::new());
    let config = IngestConfig {
        buffer_size: 64,
        force_streaming: true,
        ..Default::default()
    };
    let mut processor = ObjectProcessor::new(store, checkpoints.clone(), sink.clone(), config);
    let outcome = processor.process(&object, &StopFlag::new()).expect("process");
    assert_eq!(outcome, ProcessOutcome::Indexed);

    // nothing new to emit, only the end-of-object marker
    assert!(sink.payloads().is_empty());
    assert!(sink.events().last().expect("events").done);
    assert!(checkpoints.get_object("logs", "done.txt").expect("get").is_none());
}

#[test]
fn test_vanished_object_is_skipped() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(HEAD).path("/logs/gone.txt");
        then.status(200)
            .header("Content-Length", "100")
            .header("ETag", "\"e1\"");
    });
    server.mock(|when, then| {
        when.method(GET).path("/logs/gone.txt");
        then.status(404);
    });

    let store = Arc::new(HttpBlobStore::new(server.base_url()).expect("client"));
    let object = store.head("logs", "gone.txt").expect("head");

    let sink = Arc::new(MemorySink::new());
    let checkpoints = checkpoints();
    let mut processor = ObjectProcessor::new(
        store,
        checkpoints.clone(),
        sink.clone(),
        IngestConfig::default(),
    );
    let outcome = processor.process(&object, &StopFlag::new()).expect("process");
    assert_eq!(outcome, ProcessOutcome::Skipped);
    assert!(sink.events().is_empty());
}
