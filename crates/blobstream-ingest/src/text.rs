//! Byte-to-text decoding and raw-byte line continuation

use encoding_rs::{CoderResult, Decoder, Encoding, UTF_8};

use blobstream_common::{IngestError, Result};

/// Stateful byte-to-text decoder for one object.
///
/// The encoding is fixed at construction: a configured label, the value
/// persisted in the object's checkpoint, or byte-order-mark detection on the
/// first chunk. Decoder state carries across chunk boundaries, so a
/// multi-byte sequence split between chunks decodes intact.
pub struct TextDecoder {
    encoding: &'static Encoding,
    decoder: Decoder,
}

impl TextDecoder {
    /// Decoder for a named encoding label, e.g. "utf-16le"
    pub fn for_label(label: &str) -> Result<Self> {
        let encoding = Encoding::for_label(label.as_bytes())
            .ok_or_else(|| IngestError::Config(format!("Unknown character set: {}", label)))?;
        Ok(Self {
            encoding,
            decoder: encoding.new_decoder_with_bom_removal(),
        })
    }

    /// Detect the encoding from a byte-order mark, falling back to UTF-8
    pub fn detect(first_chunk: &[u8]) -> Self {
        let encoding = Encoding::for_bom(first_chunk)
            .map(|(encoding, _)| encoding)
            .unwrap_or(UTF_8);
        Self {
            encoding,
            decoder: encoding.new_decoder_with_bom_removal(),
        }
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    /// Canonical encoding name, persisted in the object checkpoint
    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }

    /// Decode one chunk. An incomplete trailing sequence is held until the
    /// next call; pass `last = true` to flush at end of stream. The flag
    /// reports whether malformed input was replaced.
    pub fn decode_chunk(&mut self, bytes: &[u8], last: bool) -> (String, bool) {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(bytes.len())
            .unwrap_or(bytes.len().saturating_mul(4));
        let mut out = String::with_capacity(capacity.max(4));
        let (result, _read, had_errors) = self.decoder.decode_to_string(bytes, &mut out, last);
        debug_assert!(matches!(result, CoderResult::InputEmpty));
        (out, had_errors)
    }

    /// One-shot decode of a complete line; CSV rows parse per line
    pub fn decode_line(&self, bytes: &[u8]) -> String {
        let (text, _had_errors) = self.encoding.decode_without_bom_handling(bytes);
        text.into_owned()
    }
}

/// Cross-chunk line continuation over raw bytes.
///
/// A line split across a chunk boundary is buffered and prefixed onto the
/// next chunk's first line before parsing. Buffering happens before any
/// decoding, keeping multi-byte sequences intact.
#[derive(Debug, Default)]
pub struct LineAssembler {
    truncated: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split a chunk into complete lines, holding back a trailing partial
    /// line for the next chunk. Line terminators are stripped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut data = std::mem::take(&mut self.truncated);
        data.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        for (i, &byte) in data.iter().enumerate() {
            if byte == b'\n' {
                let mut end = i;
                if end > start && data[end - 1] == b'\r' {
                    end -= 1;
                }
                lines.push(data[start..end].to_vec());
                start = i + 1;
            }
        }
        self.truncated = data[start..].to_vec();
        lines
    }

    /// Bytes held back waiting for a newline
    pub fn pending(&self) -> usize {
        self.truncated.len()
    }

    /// Hand out the final unterminated line at end of stream or member
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.truncated.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.truncated))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_falls_back_to_utf8() {
        let decoder = TextDecoder::detect(b"plain ascii content");
        assert_eq!(decoder.name(), "UTF-8");
    }

    #[test]
    fn test_detect_utf16le_bom() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "hi".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let mut decoder = TextDecoder::detect(&bytes);
        assert_eq!(decoder.name(), "UTF-16LE");

        let (text, had_errors) = decoder.decode_chunk(&bytes, true);
        assert_eq!(text, "hi");
        assert!(!had_errors);
    }

    #[test]
    fn test_split_multibyte_sequence_survives_chunk_boundary() {
        let bytes = "héllo".as_bytes();
        // split inside the two-byte é sequence
        let (a, b) = bytes.split_at(2);

        let mut decoder = TextDecoder::detect(bytes);
        let (first, _) = decoder.decode_chunk(a, false);
        let (second, _) = decoder.decode_chunk(b, true);
        assert_eq!(format!("{}{}", first, second), "héllo");
    }

    #[test]
    fn test_unknown_label_is_config_error() {
        assert!(TextDecoder::for_label("not-a-charset").is_err());
    }

    #[test]
    fn test_line_assembler_buffers_partial_lines() {
        let mut lines = LineAssembler::new();
        assert_eq!(lines.push(b"alpha\nbra"), vec![b"alpha".to_vec()]);
        assert_eq!(lines.pending(), 3);
        assert_eq!(lines.push(b"vo\ncharlie"), vec![b"bravo".to_vec()]);
        assert_eq!(lines.flush(), Some(b"charlie".to_vec()));
        assert_eq!(lines.flush(), None);
    }

    #[test]
    fn test_line_assembler_strips_crlf() {
        let mut lines = LineAssembler::new();
        assert_eq!(lines.push(b"one\r\ntwo\n"), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(lines.pending(), 0);
    }
}
