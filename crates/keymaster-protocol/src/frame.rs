//! Wire framing for the serial/BLE bridge
//!
//! Every message on the wireless link is a UTF-8 text line. Lines that fit in
//! a single payload travel as-is; longer lines are split into numbered chunk
//! frames:
//!
//! ```text
//! <line>\n                                    unchunked message
//! CHUNK:<n>/<N>:<payload>                     chunk n of N, 1-indexed
//! CHUNK:<N>/<N>:<payload>\n                   last chunk carries the terminator
//! RAW:<original>\n                            malformed chunk header, forwarded
//! ERR:CHUNK_TIMEOUT:received <k>/<N> chunks\n reassembly abandoned
//! ```
//!
//! Independently of chunking, every payload is cut into link-level fragments
//! no larger than the notification size. Fragments carry no header.

use std::borrow::Cow;

use crate::error::{ProtocolError, Result};

/// Line terminator used on both links
pub const LINE_TERMINATOR: char = '\n';

/// Prefix of a chunk frame
pub const CHUNK_PREFIX: &str = "CHUNK:";

/// Prefix of a forwarded malformed chunk
pub const RAW_PREFIX: &str = "RAW:";

/// Prefix of a reassembly timeout report
pub const CHUNK_TIMEOUT_PREFIX: &str = "ERR:CHUNK_TIMEOUT:";

/// Largest line sent without the chunk protocol
pub const DEFAULT_CHUNK_PAYLOAD: usize = 480;

/// Bytes reserved for the `CHUNK:n/N:` header inside one chunk
pub const CHUNK_HEADER_RESERVE: usize = 20;

/// Safe size of one BLE notification
pub const DEFAULT_NOTIFY_SIZE: usize = 200;

/// Host line buffer limit before an unterminated line is discarded
pub const DEFAULT_LINE_LIMIT: usize = 4096;

/// Chunk reassembly timeout in milliseconds
pub const DEFAULT_CHUNK_TIMEOUT_MS: u64 = 5000;

/// One parsed chunk frame, borrowing its payload from the received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// Position of this chunk, `1..=total`
    pub index: usize,
    /// Number of chunks in the message
    pub total: usize,
    /// Payload after the header (the last chunk keeps its terminator)
    pub data: &'a str,
}

impl<'a> Chunk<'a> {
    /// Parse a `CHUNK:<n>/<N>:<data>` frame
    pub fn parse(message: &'a str) -> Result<Self> {
        let rest = message
            .strip_prefix(CHUNK_PREFIX)
            .ok_or(ProtocolError::NotAChunk)?;

        let (header, data) = rest
            .split_once(':')
            .ok_or_else(|| ProtocolError::MalformedChunk("missing ':' after header".to_string()))?;

        let (index, total) = header
            .split_once('/')
            .ok_or_else(|| ProtocolError::MalformedChunk(format!("header {:?} has no '/'", header)))?;

        let index: usize = index
            .parse()
            .map_err(|_| ProtocolError::MalformedChunk(format!("bad chunk index {:?}", index)))?;
        let total: usize = total
            .parse()
            .map_err(|_| ProtocolError::MalformedChunk(format!("bad chunk total {:?}", total)))?;

        if total == 0 || index == 0 || index > total {
            return Err(ProtocolError::ChunkOutOfRange { index, total });
        }

        Ok(Self { index, total, data })
    }

    /// Encode this chunk as a frame, adding the terminator on the last chunk
    pub fn encode(&self) -> String {
        let mut frame = format!("{}{}/{}:{}", CHUNK_PREFIX, self.index, self.total, self.data);
        if self.is_last() && !self.data.ends_with(LINE_TERMINATOR) {
            frame.push(LINE_TERMINATOR);
        }
        frame
    }

    /// Whether this is the final chunk of its message
    pub fn is_last(&self) -> bool {
        self.index == self.total
    }
}

/// Check whether a received message uses the chunk protocol
pub fn is_chunk(message: &str) -> bool {
    message.starts_with(CHUNK_PREFIX)
}

/// Splits long lines into chunk frames
#[derive(Debug, Clone, Copy)]
pub struct ChunkSplitter {
    payload_limit: usize,
    data_size: usize,
}

impl ChunkSplitter {
    /// Create a splitter for the given single-chunk payload limit
    ///
    /// Each chunk carries at most `payload_limit - CHUNK_HEADER_RESERVE` bytes
    /// of payload.
    pub fn new(payload_limit: usize) -> Result<Self> {
        let data_size = payload_limit.saturating_sub(CHUNK_HEADER_RESERVE);
        if data_size == 0 {
            return Err(ProtocolError::ChunkSizeTooSmall(payload_limit));
        }
        Ok(Self {
            payload_limit,
            data_size,
        })
    }

    /// Largest line sent without chunking
    pub fn payload_limit(&self) -> usize {
        self.payload_limit
    }

    /// Payload bytes per chunk
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Check if a line (without terminator) needs the chunk protocol
    pub fn needs_chunking(&self, line: &[u8]) -> bool {
        line.len() > self.payload_limit
    }

    /// Split text into payload pieces of at most `data_size` bytes
    ///
    /// Pieces end on UTF-8 character boundaries, so a piece may be a few bytes
    /// short of `data_size` when a multi-byte character straddles the cut.
    pub fn split<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let mut pieces = Vec::with_capacity(text.len().div_ceil(self.data_size));
        let mut rest = text;

        while !rest.is_empty() {
            let mut end = rest.len().min(self.data_size);
            while !rest.is_char_boundary(end) {
                end -= 1;
            }
            if end == 0 {
                // data_size is smaller than the next character
                end = rest
                    .char_indices()
                    .nth(1)
                    .map(|(i, _)| i)
                    .unwrap_or(rest.len());
            }
            let (head, tail) = rest.split_at(end);
            pieces.push(head);
            rest = tail;
        }

        pieces
    }

    /// Split text into encoded `CHUNK:n/N:` frames, in send order
    pub fn frames(&self, text: &str) -> Vec<String> {
        let pieces = self.split(text);
        let total = pieces.len();
        pieces
            .into_iter()
            .enumerate()
            .map(|(i, data)| {
                Chunk {
                    index: i + 1,
                    total,
                    data,
                }
                .encode()
            })
            .collect()
    }
}

impl Default for ChunkSplitter {
    fn default() -> Self {
        Self {
            payload_limit: DEFAULT_CHUNK_PAYLOAD,
            data_size: DEFAULT_CHUNK_PAYLOAD - CHUNK_HEADER_RESERVE,
        }
    }
}

/// Cut a payload into link-level fragments of at most `max` bytes
pub fn fragments(payload: &[u8], max: usize) -> std::slice::Chunks<'_, u8> {
    payload.chunks(max.max(1))
}

/// Append the line terminator if missing
pub fn terminated(message: &str) -> Cow<'_, str> {
    if message.ends_with(LINE_TERMINATOR) {
        Cow::Borrowed(message)
    } else {
        Cow::Owned(format!("{}{}", message, LINE_TERMINATOR))
    }
}

/// Line forwarded for a chunk frame that could not be parsed
pub fn raw_line(original: &str) -> String {
    format!(
        "{}{}{}",
        RAW_PREFIX,
        original.trim_end_matches(LINE_TERMINATOR),
        LINE_TERMINATOR
    )
}

/// Line reporting an abandoned reassembly
pub fn chunk_timeout_line(received: usize, total: usize) -> String {
    format!(
        "{}received {}/{} chunks{}",
        CHUNK_TIMEOUT_PREFIX, received, total, LINE_TERMINATOR
    )
}

/// Display preview of a message: terminator stripped, at most `max_chars`
pub fn preview(message: &str, max_chars: usize) -> String {
    message
        .trim_end_matches(LINE_TERMINATOR)
        .chars()
        .take(max_chars)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chunk() {
        let chunk = Chunk::parse("CHUNK:2/5:hello").unwrap();
        assert_eq!(chunk.index, 2);
        assert_eq!(chunk.total, 5);
        assert_eq!(chunk.data, "hello");
        assert!(!chunk.is_last());
    }

    #[test]
    fn test_parse_chunk_payload_with_colons() {
        let chunk = Chunk::parse("CHUNK:1/1:RSP:status:{\"a\":1}\n").unwrap();
        assert_eq!(chunk.data, "RSP:status:{\"a\":1}\n");
        assert!(chunk.is_last());
    }

    #[test]
    fn test_parse_malformed_headers() {
        assert!(matches!(
            Chunk::parse("CHUNK:abc"),
            Err(ProtocolError::MalformedChunk(_))
        ));
        assert!(matches!(
            Chunk::parse("CHUNK:x/3:data"),
            Err(ProtocolError::MalformedChunk(_))
        ));
        assert!(matches!(
            Chunk::parse("CHUNK:1-3:data"),
            Err(ProtocolError::MalformedChunk(_))
        ));
        assert!(matches!(
            Chunk::parse("CHUNK:1/2/3:data"),
            Err(ProtocolError::MalformedChunk(_))
        ));
        assert!(matches!(
            Chunk::parse("hello"),
            Err(ProtocolError::NotAChunk)
        ));
    }

    #[test]
    fn test_parse_out_of_range() {
        assert!(matches!(
            Chunk::parse("CHUNK:0/3:data"),
            Err(ProtocolError::ChunkOutOfRange { index: 0, total: 3 })
        ));
        assert!(matches!(
            Chunk::parse("CHUNK:4/3:data"),
            Err(ProtocolError::ChunkOutOfRange { index: 4, total: 3 })
        ));
        assert!(matches!(
            Chunk::parse("CHUNK:1/0:data"),
            Err(ProtocolError::ChunkOutOfRange { .. })
        ));
    }

    #[test]
    fn test_encode_terminator_only_on_last() {
        let first = Chunk {
            index: 1,
            total: 2,
            data: "ab",
        };
        let last = Chunk {
            index: 2,
            total: 2,
            data: "cd",
        };
        assert_eq!(first.encode(), "CHUNK:1/2:ab");
        assert_eq!(last.encode(), "CHUNK:2/2:cd\n");
    }

    #[test]
    fn test_splitter_chunk_count() {
        let splitter = ChunkSplitter::new(DEFAULT_CHUNK_PAYLOAD).unwrap();
        assert_eq!(splitter.data_size(), 460);

        let text = "x".repeat(1000);
        let frames = splitter.frames(&text);
        assert_eq!(frames.len(), 1000usize.div_ceil(460));
        assert!(frames[0].starts_with("CHUNK:1/3:"));
        assert!(frames[2].starts_with("CHUNK:3/3:"));
        assert!(frames[2].ends_with('\n'));
        assert!(!frames[0].ends_with('\n'));
    }

    #[test]
    fn test_splitter_respects_char_boundaries() {
        let splitter = ChunkSplitter::new(CHUNK_HEADER_RESERVE + 5).unwrap();
        // 3 bytes per character
        let text = "日本語テキスト";
        let pieces = splitter.split(text);
        assert!(pieces.iter().all(|p| p.len() <= 5));
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn test_splitter_rejects_tiny_payload() {
        assert!(matches!(
            ChunkSplitter::new(CHUNK_HEADER_RESERVE),
            Err(ProtocolError::ChunkSizeTooSmall(_))
        ));
    }

    #[test]
    fn test_needs_chunking_boundary() {
        let splitter = ChunkSplitter::default();
        assert!(!splitter.needs_chunking(&[b'a'; 480]));
        assert!(splitter.needs_chunking(&[b'a'; 481]));
    }

    #[test]
    fn test_fragments() {
        let payload = vec![7u8; 450];
        let sizes: Vec<usize> = fragments(&payload, DEFAULT_NOTIFY_SIZE)
            .map(|f| f.len())
            .collect();
        assert_eq!(sizes, vec![200, 200, 50]);
    }

    #[test]
    fn test_markers() {
        assert_eq!(raw_line("CHUNK:oops"), "RAW:CHUNK:oops\n");
        assert_eq!(raw_line("CHUNK:oops\n"), "RAW:CHUNK:oops\n");
        assert_eq!(
            chunk_timeout_line(1, 3),
            "ERR:CHUNK_TIMEOUT:received 1/3 chunks\n"
        );
        assert_eq!(terminated("abc"), "abc\n");
        assert_eq!(terminated("abc\n"), "abc\n");
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview("hello\n", 40), "hello");
        assert_eq!(preview(&"y".repeat(100), 40).len(), 40);
    }
}
