//! Archive-format decoding
//!
//! Normalizes plain / gzip / zip / tar objects into one frame iterator so a
//! single consumer can treat any object as a flat byte stream while still
//! seeing where one logical sub-file ends and the next begins.

use std::io::{Cursor, Read};
use std::sync::Arc;

use flate2::read::GzDecoder;

use blobstream_common::{IngestError, Result};

use crate::config::IngestConfig;
use crate::fetch::RangeFetcher;
use crate::store::{ObjectHandle, RemoteStore};

mod tar_stream;

use tar_stream::TarStream;

/// Unit flowing out of a decoder: one bounded byte buffer tagged with the
/// logical sub-file it belongs to. Consumers detect a file-boundary
/// transition by comparing consecutive frames' `member_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub bytes: Vec<u8>,
    pub member_path: String,
}

/// Container format, selected by key suffix at the discovery boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Plain,
    Gzip,
    Zip,
    Tar { gzipped: bool },
}

impl ContainerFormat {
    pub fn from_key(key: &str) -> Self {
        let lower = key.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            ContainerFormat::Tar { gzipped: true }
        } else if lower.ends_with(".tar") {
            ContainerFormat::Tar { gzipped: false }
        } else if lower.ends_with(".zip") {
            ContainerFormat::Zip
        } else if lower.ends_with(".gz") {
            ContainerFormat::Gzip
        } else {
            ContainerFormat::Plain
        }
    }

    /// Zip needs the central directory, which lives at the end of the file
    fn requires_full_buffer(&self) -> bool {
        matches!(self, ContainerFormat::Zip)
    }
}

/// Byte source feeding a decoder: a live ranged connection, or an in-memory
/// copy for small objects and seek-requiring formats
pub enum ByteSource {
    Streaming(RangeFetcher),
    Buffered(Cursor<Vec<u8>>),
}

impl Read for ByteSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ByteSource::Streaming(fetcher) => fetcher.read(buf),
            ByteSource::Buffered(cursor) => cursor.read(buf),
        }
    }
}

enum DecoderKind {
    Plain {
        reader: ByteSource,
    },
    Gzip {
        reader: GzDecoder<ByteSource>,
    },
    Zip {
        archive: zip::ZipArchive<Cursor<Vec<u8>>>,
        next_entry: usize,
        current: Option<(String, Cursor<Vec<u8>>)>,
    },
    Tar {
        stream: TarStream,
    },
}

/// Uniform frame iterator over any container format.
///
/// The decoder exclusively owns the format parser state built atop its byte
/// source; seeking is forward-discard only, over decoded bytes.
pub struct ArchiveDecoder {
    kind: DecoderKind,
    /// Member path for single-stream formats
    member: String,
    buffer_size: usize,
    /// Decoded bytes handed to the caller; the offset domain checkpoints use
    position: u64,
    /// Over-read remainder from a seek, yielded first on the next pull
    pending: Option<ChunkFrame>,
}

impl ArchiveDecoder {
    /// Build a decoder for `object`, resuming at `resume_from` decoded bytes.
    ///
    /// An object no larger than one buffer is read once into memory instead
    /// of keeping a live connection, so a pass over many small objects does
    /// not hold a socket per object. Plain content needs no decoding, so its
    /// streaming connection opens directly at the resume offset; every other
    /// format reads from byte zero and the caller seeks forward.
    pub fn for_object(
        store: Arc<dyn RemoteStore>,
        object: &ObjectHandle,
        config: &IngestConfig,
        resume_from: u64,
    ) -> Result<Self> {
        let format = ContainerFormat::from_key(&object.key);
        let small = object.size <= config.buffer_size as u64 && !config.force_streaming;

        let mut start = 0;
        let source = if small || format.requires_full_buffer() {
            let (mut body, _) = store.get(&object.bucket, &object.key, 0)?;
            let mut data = Vec::with_capacity(object.size as usize);
            body.read_to_end(&mut data)?;
            ByteSource::Buffered(Cursor::new(data))
        } else {
            if format == ContainerFormat::Plain {
                start = resume_from;
            }
            ByteSource::Streaming(RangeFetcher::open(store, object, start, config.buffer_size)?)
        };

        let mut decoder = Self::from_source(source, format, &object.key, config.buffer_size)?;
        decoder.position = start;
        Ok(decoder)
    }

    /// Build from an explicit source, letting the caller pick the path
    /// (e.g. keeping a small object on the streaming path).
    pub fn from_source(
        source: ByteSource,
        format: ContainerFormat,
        key: &str,
        buffer_size: usize,
    ) -> Result<Self> {
        let member = member_name(key, format);
        let kind = match format {
            ContainerFormat::Plain => DecoderKind::Plain { reader: source },
            ContainerFormat::Gzip => DecoderKind::Gzip {
                reader: GzDecoder::new(source),
            },
            ContainerFormat::Zip => {
                let data = read_all(source)?;
                let archive = zip::ZipArchive::new(Cursor::new(data))
                    .map_err(|e| IngestError::Decode(format!("Failed to read zip archive: {}", e)))?;
                DecoderKind::Zip {
                    archive,
                    next_entry: 0,
                    current: None,
                }
            },
            ContainerFormat::Tar { gzipped } => {
                let reader: Box<dyn Read + Send> = if gzipped {
                    Box::new(GzDecoder::new(source))
                } else {
                    Box::new(source)
                };
                DecoderKind::Tar {
                    stream: TarStream::new(reader),
                }
            },
        };

        Ok(Self {
            kind,
            member,
            buffer_size,
            position: 0,
            pending: None,
        })
    }

    /// Decoded-stream offset of the next byte to be delivered
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn next_frame(&mut self) -> Result<Option<ChunkFrame>> {
        let frame = self.take_next()?;
        if let Some(ref frame) = frame {
            self.position += frame.bytes.len() as u64;
        }
        Ok(frame)
    }

    /// Forward-discard seek over the decoded stream.
    ///
    /// O(target) and invoked once per object resume, not per request: frames
    /// are pulled and dropped until `target` bytes have been skipped; the
    /// over-read remainder is buffered and yielded first on the next pull.
    ///
    /// Plain content is the exception: its decoded stream is the raw stream,
    /// so the seek goes to the source instead (a ranged reopen for a live
    /// connection, a cursor move for a buffered one).
    pub fn seek(&mut self, target: u64) -> Result<()> {
        if target == self.position {
            return Ok(());
        }

        if let DecoderKind::Plain { reader } = &mut self.kind {
            self.pending = None;
            match reader {
                ByteSource::Streaming(fetcher) => {
                    fetcher.seek(target)?;
                    self.position = target;
                },
                ByteSource::Buffered(cursor) => {
                    let end = cursor.get_ref().len() as u64;
                    cursor.set_position(target.min(end));
                    self.position = target.min(end);
                },
            }
            return Ok(());
        }

        while self.position < target {
            let Some(mut frame) = self.take_next()? else {
                break;
            };
            let len = frame.bytes.len() as u64;
            if self.position + len <= target {
                self.position += len;
            } else {
                let split = (target - self.position) as usize;
                frame.bytes.drain(..split);
                self.position = target;
                self.pending = Some(frame);
            }
        }
        Ok(())
    }

    fn take_next(&mut self) -> Result<Option<ChunkFrame>> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        self.next_raw()
    }

    fn next_raw(&mut self) -> Result<Option<ChunkFrame>> {
        match &mut self.kind {
            DecoderKind::Plain { reader } => {
                Ok(read_chunk(reader, self.buffer_size)?.map(|bytes| ChunkFrame {
                    bytes,
                    member_path: self.member.clone(),
                }))
            },
            DecoderKind::Gzip { reader } => {
                let chunk = read_chunk(reader, self.buffer_size)
                    .map_err(|e| IngestError::Decode(format!("Gzip decode failed: {}", e)))?;
                Ok(chunk.map(|bytes| ChunkFrame {
                    bytes,
                    member_path: self.member.clone(),
                }))
            },
            DecoderKind::Zip {
                archive,
                next_entry,
                current,
            } => loop {
                if let Some((name, cursor)) = current.as_mut() {
                    if let Some(bytes) = read_chunk(cursor, self.buffer_size)? {
                        return Ok(Some(ChunkFrame {
                            bytes,
                            member_path: name.clone(),
                        }));
                    }
                    *current = None;
                }

                if *next_entry >= archive.len() {
                    return Ok(None);
                }
                let index = *next_entry;
                *next_entry += 1;

                let mut entry = archive.by_index(index).map_err(|e| {
                    IngestError::Decode(format!("Failed to read zip entry {}: {}", index, e))
                })?;
                if entry.is_dir() || entry.size() == 0 {
                    continue;
                }
                let name = entry.name().to_string();
                // the compressed archive is already fully in memory, so one
                // decompressed entry is a bounded buffer too
                let mut data = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut data).map_err(|e| {
                    IngestError::Decode(format!("Failed to decompress zip entry {}: {}", name, e))
                })?;
                *current = Some((name, Cursor::new(data)));
            },
            DecoderKind::Tar { stream } => {
                Ok(stream
                    .next_chunk(self.buffer_size)?
                    .map(|(bytes, member_path)| ChunkFrame { bytes, member_path }))
            },
        }
    }
}

/// Read up to one full buffer, short only at end of stream
fn read_chunk<R: Read>(reader: &mut R, buffer_size: usize) -> std::io::Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; buffer_size];
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
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

fn read_all(source: ByteSource) -> Result<Vec<u8>> {
    match source {
        ByteSource::Buffered(cursor) => Ok(cursor.into_inner()),
        ByteSource::Streaming(mut fetcher) => {
            let mut data = Vec::new();
            fetcher.read_to_end(&mut data)?;
            Ok(data)
        },
    }
}

fn member_name(key: &str, format: ContainerFormat) -> String {
    match format {
        ContainerFormat::Gzip if key.to_ascii_lowercase().ends_with(".gz") => {
            key[..key.len() - 3].to_string()
        },
        _ => key.to_string(),
    }
}
