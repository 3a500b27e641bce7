//! Payload decoding: turns a complete, non-chunked payload into text.
//!
//! Fails closed: a truncated or corrupt compressed stream, an oversized
//! result, or bytes that are not valid UTF-8 are all errors. Nothing is
//! ever decoded lossily.

use std::io::Read;

use flate2::read::GzDecoder;
use flate2::{Decompress, FlushDecompress, Status};

use crate::wire::MessageType;

/// Default cap on decoded payload size (8 MiB).
pub const DEFAULT_DECOMPRESS_SIZE_LIMIT: usize = 8 * 1024 * 1024;

/// Output buffer growth step while inflating.
const INFLATE_STEP: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported message type: {0:?}")]
    UnsupportedType(MessageType),

    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("decoded payload exceeds limit of {0} bytes")]
    SizeLimitExceeded(usize),
}

impl DecodeError {
    /// True for every failure that came from the payload's own bytes
    /// (as opposed to its declared type).
    pub fn is_decompression_failure(&self) -> bool {
        matches!(
            self,
            DecodeError::DecompressionFailed(_) | DecodeError::SizeLimitExceeded(_)
        )
    }
}

/// Stateless decoder with a fixed output size limit.
#[derive(Debug, Clone, Copy)]
pub struct PayloadDecoder {
    size_limit: usize,
}

impl Default for PayloadDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_DECOMPRESS_SIZE_LIMIT)
    }
}

impl PayloadDecoder {
    pub fn new(size_limit: usize) -> Self {
        Self { size_limit }
    }

    pub fn size_limit(&self) -> usize {
        self.size_limit
    }

    /// Decode a payload of the given type.
    ///
    /// `Chunked` payloads must go through the aggregator first and are
    /// rejected here, as is `Unsupported`.
    pub fn decode(&self, kind: MessageType, payload: &[u8]) -> Result<String, DecodeError> {
        let bytes = match kind {
            MessageType::Zlib => self.inflate_zlib(payload)?,
            MessageType::Gzip => self.gunzip(payload)?,
            MessageType::Uncompressed => {
                if payload.len() > self.size_limit {
                    return Err(DecodeError::SizeLimitExceeded(self.size_limit));
                }
                return std::str::from_utf8(payload)
                    .map(str::to_owned)
                    .map_err(|e| DecodeError::DecompressionFailed(format!("invalid utf-8: {e}")));
            }
            MessageType::Chunked | MessageType::Unsupported => {
                return Err(DecodeError::UnsupportedType(kind));
            }
        };

        String::from_utf8(bytes)
            .map_err(|e| DecodeError::DecompressionFailed(format!("invalid utf-8: {e}")))
    }

    /// Inflate a zlib stream, requiring the stream to reach its end marker.
    ///
    /// The streaming reader treats a truncated zlib stream as a clean EOF,
    /// so this drives `Decompress` directly and insists on `StreamEnd`.
    fn inflate_zlib(&self, payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let mut inflater = Decompress::new(true);
        // One byte of headroom past the limit so an exactly-full stream can
        // still reach its trailer.
        let ceiling = self.size_limit.saturating_add(1);
        let mut out = Vec::with_capacity(INFLATE_STEP.min(ceiling));

        loop {
            if out.len() == out.capacity() {
                if out.len() > self.size_limit {
                    return Err(DecodeError::SizeLimitExceeded(self.size_limit));
                }
                let step = INFLATE_STEP.min(ceiling - out.len());
                out.reserve_exact(step);
            }

            let consumed_before = inflater.total_in();
            let produced_before = inflater.total_out();
            let input = &payload[consumed_before as usize..];

            let status = inflater
                .decompress_vec(input, &mut out, FlushDecompress::Finish)
                .map_err(|e| DecodeError::DecompressionFailed(e.to_string()))?;

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    let stalled = inflater.total_in() == consumed_before
                        && inflater.total_out() == produced_before;
                    if stalled && out.len() < out.capacity() {
                        return Err(DecodeError::DecompressionFailed(
                            "truncated zlib stream".into(),
                        ));
                    }
                }
            }
        }

        if out.len() > self.size_limit {
            return Err(DecodeError::SizeLimitExceeded(self.size_limit));
        }
        Ok(out)
    }

    /// Gunzip a single gzip member. The trailer CRC and length are checked
    /// by the decoder, so truncation surfaces as an I/O error.
    fn gunzip(&self, payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let mut out = Vec::new();
        GzDecoder::new(payload)
            .take(self.size_limit as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| DecodeError::DecompressionFailed(e.to_string()))?;

        if out.len() > self.size_limit {
            return Err(DecodeError::SizeLimitExceeded(self.size_limit));
        }
        Ok(out)
    }
}
