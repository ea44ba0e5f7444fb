//! Streaming tar member decoding
//!
//! Members are walked over raw 512-byte block framing with `tar::Header`
//! doing the format interpretation. The tar crate's `Entries` iterator
//! borrows the archive for its whole walk and cannot be suspended between
//! pull calls, so the block loop lives here.

use std::io::Read;

use blobstream_common::{IngestError, Result};

const BLOCK_SIZE: usize = 512;

pub(super) struct TarStream {
    reader: Box<dyn Read + Send>,
    current: Option<Member>,
    /// Pending GNU long name applying to the next header
    long_name: Option<String>,
    done: bool,
}

struct Member {
    path: String,
    remaining: u64,
    padding: usize,
}

impl TarStream {
    pub(super) fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            current: None,
            long_name: None,
            done: false,
        }
    }

    /// Next content chunk with its member path. A member of size `s` yields
    /// `s / buffer_size` full chunks plus one tail chunk when the size is
    /// not an exact multiple, preserving exact member boundaries.
    pub(super) fn next_chunk(&mut self, buffer_size: usize) -> Result<Option<(Vec<u8>, String)>> {
        loop {
            if self.done {
                return Ok(None);
            }

            if let Some(member) = self.current.as_mut() {
                let take = buffer_size.min(member.remaining as usize);
                let mut chunk = vec![0u8; take];
                self.reader
                    .read_exact(&mut chunk)
                    .map_err(|e| IngestError::Decode(format!("Truncated tar member: {}", e)))?;
                member.remaining -= take as u64;
                let path = member.path.clone();
                if member.remaining == 0 {
                    let padding = member.padding;
                    self.current = None;
                    self.skip(padding)?;
                }
                return Ok(Some((chunk, path)));
            }

            if !self.advance()? {
                self.done = true;
                return Ok(None);
            }
        }
    }

    /// Read headers until the next regular member; false at end of archive.
    fn advance(&mut self) -> Result<bool> {
        loop {
            let Some(block) = self.read_block()? else {
                return Ok(false);
            };
            if block.iter().all(|&b| b == 0) {
                // end-of-archive marker
                return Ok(false);
            }

            let mut header = tar::Header::new_old();
            header.as_mut_bytes().copy_from_slice(&block);
            let size = header
                .entry_size()
                .map_err(|e| IngestError::Decode(format!("Bad tar entry size: {}", e)))?;
            let entry_type = header.entry_type();

            if entry_type.is_gnu_longname() {
                self.long_name = Some(self.read_name(size)?);
                continue;
            }
            if entry_type.is_pax_local_extensions()
                || entry_type.is_pax_global_extensions()
                || entry_type.is_gnu_longlink()
            {
                self.skip(content_with_padding(size))?;
                continue;
            }
            if !entry_type.is_file() {
                self.long_name = None;
                self.skip(content_with_padding(size))?;
                continue;
            }

            let path = match self.long_name.take() {
                Some(name) => name,
                None => header
                    .path()
                    .map_err(|e| IngestError::Decode(format!("Bad tar member path: {}", e)))?
                    .to_string_lossy()
                    .into_owned(),
            };

            if size == 0 {
                continue;
            }

            self.current = Some(Member {
                path,
                remaining: size,
                padding: block_padding(size),
            });
            return Ok(true);
        }
    }

    fn read_block(&mut self) -> Result<Option<[u8; BLOCK_SIZE]>> {
        let mut block = [0u8; BLOCK_SIZE];
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.reader.read(&mut block[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        match filled {
            0 => Ok(None),
            BLOCK_SIZE => Ok(Some(block)),
            _ => Err(IngestError::Decode("Truncated tar header block".to_string())),
        }
    }

    fn read_name(&mut self, size: u64) -> Result<String> {
        let mut data = vec![0u8; size as usize];
        self.reader
            .read_exact(&mut data)
            .map_err(|e| IngestError::Decode(format!("Truncated tar long name: {}", e)))?;
        self.skip(block_padding(size))?;
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        data.truncate(end);
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    fn skip(&mut self, mut count: usize) -> Result<()> {
        let mut scratch = [0u8; BLOCK_SIZE];
        while count > 0 {
            let take = count.min(scratch.len());
            self.reader
                .read_exact(&mut scratch[..take])
                .map_err(|e| IngestError::Decode(format!("Truncated tar content: {}", e)))?;
            count -= take;
        }
        Ok(())
    }
}

fn block_padding(size: u64) -> usize {
    ((BLOCK_SIZE as u64 - size % BLOCK_SIZE as u64) % BLOCK_SIZE as u64) as usize
}

fn content_with_padding(size: u64) -> usize {
    size as usize + block_padding(size)
}
