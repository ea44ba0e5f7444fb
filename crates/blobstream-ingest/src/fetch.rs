//! Pull-based ranged fetching of one remote object

use std::io::Read;
use std::sync::Arc;

use tracing::debug;

use blobstream_common::Result;

use crate::store::{ObjectBody, ObjectHandle, RemoteStore};

/// Byte-chunk reader over a single remote object.
///
/// The fetcher exclusively owns the live HTTP body. A `seek` is never a
/// local-buffer seek: the current connection is discarded and a new ranged
/// request is opened at the target offset, one network round trip per call.
pub struct RangeFetcher {
    store: Arc<dyn RemoteStore>,
    object: ObjectHandle,
    body: Option<ObjectBody>,
    buffer_size: usize,
    /// Offset the current connection was opened at
    start: u64,
    /// Bytes delivered on the current connection
    delivered: u64,
}

impl RangeFetcher {
    /// Open a ranged GET at `start` bytes.
    pub fn open(
        store: Arc<dyn RemoteStore>,
        object: &ObjectHandle,
        start: u64,
        buffer_size: usize,
    ) -> Result<Self> {
        let (body, _) = store.get(&object.bucket, &object.key, start)?;
        debug!(bucket = %object.bucket, key = %object.key, start, "Opened ranged fetch");
        Ok(Self {
            store,
            object: object.clone(),
            body: Some(body),
            buffer_size,
            start,
            delivered: 0,
        })
    }

    /// Absolute offset of the next byte this fetcher will deliver
    pub fn tell(&self) -> u64 {
        self.start + self.delivered
    }

    /// Pull the next chunk, filled to the buffer size except at end of
    /// stream. `None` once the body is exhausted or closed.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; self.buffer_size];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(buf))
    }

    /// Discard the current connection and reopen at `offset`.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.close();
        let (body, _) = self
            .store
            .get(&self.object.bucket, &self.object.key, offset)?;
        debug!(bucket = %self.object.bucket, key = %self.object.key, offset, "Reopened at offset");
        self.body = Some(body);
        self.start = offset;
        self.delivered = 0;
        Ok(())
    }

    pub fn close(&mut self) {
        self.body = None;
    }
}

impl Read for RangeFetcher {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let Some(body) = self.body.as_mut() else {
            return Ok(0);
        };
        let n = body.read(buf)?;
        self.delivered += n as u64;
        Ok(n)
    }
}
