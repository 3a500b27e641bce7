//! loghaul wire format: how an inbound datagram is classified and how a
//! fragment of a chunked message is framed.
//!
//! Classification looks at the first two bytes of a datagram and nothing
//! else. A chunked datagram starts with a fixed 12-byte header followed by
//! the fragment body.
//!
//! The header type is #[repr(C, packed)] and uses zerocopy derives for
//! allocation-free parsing. There is no unsafe code in this module.

use std::fmt;

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Magic numbers ────────────────────────────────────────────────────────────

/// First byte of every zlib stream (deflate, 32K window).
pub const ZLIB_MAGIC: u8 = 0x78;

/// gzip member header (RFC 1952).
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Prefix of every fragment of a chunked message.
pub const CHUNKED_MAGIC: [u8; 2] = [0x1e, 0x0f];

/// Datagrams shorter than this cannot be classified.
pub const MIN_DATAGRAM_LEN: usize = 2;

/// Wire size of [`ChunkHeader`].
pub const CHUNK_HEADER_LEN: usize = 12;

/// A sequence count is a single byte on the wire.
pub const MAX_SEQUENCE_COUNT: usize = u8::MAX as usize;

// ── Message type ─────────────────────────────────────────────────────────────

/// What a datagram claims to be, judged from its first two bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Single datagram, zlib compressed.
    Zlib,
    /// Single datagram, gzip compressed.
    Gzip,
    /// One fragment of a larger message.
    Chunked,
    /// Anything without a known magic number. May still fail to decode.
    Uncompressed,
    /// Starts like zlib but fails the header checksum.
    Unsupported,
}

/// Classify a two-byte prefix.
///
/// Total and pure: every prefix maps to exactly one variant.
pub fn sniff(prefix: [u8; 2]) -> MessageType {
    match prefix {
        // RFC 1950: CMF*256 + FLG must be a multiple of 31.
        [ZLIB_MAGIC, flg] => {
            if u16::from_be_bytes([ZLIB_MAGIC, flg]) % 31 == 0 {
                MessageType::Zlib
            } else {
                MessageType::Unsupported
            }
        }
        GZIP_MAGIC => MessageType::Gzip,
        CHUNKED_MAGIC => MessageType::Chunked,
        _ => MessageType::Uncompressed,
    }
}

/// Classify a datagram payload. Inspects at most [`MIN_DATAGRAM_LEN`] bytes.
pub fn classify(payload: &[u8]) -> Result<MessageType, WireError> {
    match payload {
        [first, second, ..] => Ok(sniff([*first, *second])),
        _ => Err(WireError::TooShort(payload.len())),
    }
}

// ── Chunk header ─────────────────────────────────────────────────────────────

/// Header carried at the front of every chunked datagram.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ChunkHeader {
    /// Always [`CHUNKED_MAGIC`].
    pub magic: [u8; 2],

    /// Shared by every fragment of one logical message.
    pub message_id: [u8; 8],

    /// Zero-based position of this fragment.
    pub sequence_number: u8,

    /// Total number of fragments the sender split the message into.
    pub sequence_count: u8,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(ChunkHeader, [u8; CHUNK_HEADER_LEN]);

/// Correlation id of a chunked message. Displayed as lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub [u8; 8]);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A parsed fragment: validated header fields plus the body that follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: CorrelationId,
    pub sequence_index: u8,
    pub sequence_count: u8,
    pub body: Bytes,
}

/// Parse a datagram already classified as [`MessageType::Chunked`].
///
/// The body is a zero-copy slice of `payload`.
pub fn parse_chunk(payload: &Bytes) -> Result<Chunk, WireError> {
    let header = ChunkHeader::read_from_prefix(payload.as_ref())
        .ok_or(WireError::MalformedHeader(payload.len()))?;

    let magic = header.magic;
    if magic != CHUNKED_MAGIC {
        return Err(WireError::BadMagic(magic));
    }

    let sequence_index = header.sequence_number;
    let sequence_count = header.sequence_count;
    if sequence_index >= sequence_count {
        return Err(WireError::SequenceOutOfRange {
            index: sequence_index,
            count: sequence_count,
        });
    }

    Ok(Chunk {
        id: CorrelationId(header.message_id),
        sequence_index,
        sequence_count,
        body: payload.slice(CHUNK_HEADER_LEN..),
    })
}

/// Split `payload` into chunked datagrams with bodies of at most `max_body`
/// bytes. Inverse of reassembly; used by senders and test fixtures.
pub fn split_into_chunks(
    id: CorrelationId,
    payload: &[u8],
    max_body: usize,
) -> Result<Vec<Bytes>, WireError> {
    let max_body = max_body.max(1);
    let count = payload.len().div_ceil(max_body).max(1);
    if count > MAX_SEQUENCE_COUNT {
        return Err(WireError::TooManyChunks(count));
    }

    let bodies: Vec<&[u8]> = if payload.is_empty() {
        vec![payload]
    } else {
        payload.chunks(max_body).collect()
    };

    let datagrams = bodies
        .into_iter()
        .enumerate()
        .map(|(index, body)| {
            let header = ChunkHeader {
                magic: CHUNKED_MAGIC,
                message_id: id.0,
                sequence_number: index as u8,
                sequence_count: count as u8,
            };
            let mut datagram = Vec::with_capacity(CHUNK_HEADER_LEN + body.len());
            datagram.extend_from_slice(header.as_bytes());
            datagram.extend_from_slice(body);
            Bytes::from(datagram)
        })
        .collect();

    Ok(datagrams)
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram too short: {0} bytes, need at least {MIN_DATAGRAM_LEN}")]
    TooShort(usize),

    #[error("malformed chunk header: {0} bytes, need at least {CHUNK_HEADER_LEN}")]
    MalformedHeader(usize),

    #[error("bad chunk magic: {0:02x?}")]
    BadMagic([u8; 2]),

    #[error("chunk sequence index {index} out of range for count {count}")]
    SequenceOutOfRange { index: u8, count: u8 },

    #[error("message needs {0} chunks, at most {MAX_SEQUENCE_COUNT} fit in a sequence")]
    TooManyChunks(usize),
}

// ── Tests ────────────────────────────────────────────────────────────────────
