//! Downstream event sink interface

use std::sync::Mutex;

use blobstream_common::Result;

/// One write to the downstream indexer.
///
/// `unbroken` streams a single logical record across multiple writes;
/// `done` marks the final write of an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkEvent {
    pub data: Vec<u8>,
    pub source: String,
    pub sourcetype: String,
    pub index: String,
    pub unbroken: bool,
    pub done: bool,
}

/// Downstream sink collaborator. Implementations own delivery semantics;
/// processors only guarantee at-least-once emission.
pub trait EventSink: Send + Sync {
    fn write_event(&self, event: SinkEvent) -> Result<()>;
}

/// Collecting sink for tests and embedded use
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<SinkEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Payloads of non-empty writes, in emission order
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|event| !event.data.is_empty())
            .map(|event| event.data.clone())
            .collect()
    }
}

impl EventSink for MemorySink {
    fn write_event(&self, event: SinkEvent) -> Result<()> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_collects_in_order() {
        let sink = MemorySink::new();
        for i in 0..3u8 {
            sink.write_event(SinkEvent {
                data: vec![i],
                source: "logs/a.txt".to_string(),
                sourcetype: "blobstream:object".to_string(),
                index: "main".to_string(),
                unbroken: true,
                done: i == 2,
            })
            .expect("write failed");
        }

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert!(events[2].done);
        assert_eq!(sink.payloads(), vec![vec![0], vec![1], vec![2]]);
    }
}
