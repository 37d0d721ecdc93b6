//! zlib/deflate compressor (algorithm id 2)

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use tracing::debug;

use super::{CompressedRevision, CompressionAlgorithm, CompressionHeader, Compressor, COMPRESSION_HEADER_SIZE};
use crate::error::{QvcsError, Result};

/// Deflate-based alternative to the LZ compressor.
///
/// The body after the compression header is a zlib stream (deflate plus
/// zlib framing and checksum).
#[derive(Debug, Clone, Copy)]
pub struct DeflateCompressor {
    level: flate2::Compression,
}

impl DeflateCompressor {
    /// Create a compressor with the given level (0-9).
    pub fn new(level: u32) -> Self {
        Self { level: flate2::Compression::new(level) }
    }
}

impl Default for DeflateCompressor {
    fn default() -> Self {
        Self::new(6)
    }
}

impl Compressor for DeflateCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Deflate
    }

    fn compress(&self, input: &[u8]) -> Option<CompressedRevision> {
        let input_size = u32::try_from(input.len()).ok()?;
        let mut encoder = ZlibEncoder::new(Vec::new(), self.level);
        let body = match encoder.write_all(input).and_then(|_| encoder.finish()) {
            Ok(body) => body,
            Err(e) => {
                debug!("Deflate compression failed, storing uncompressed: {}", e);
                return None;
            }
        };
        let compressed_size = u32::try_from(COMPRESSION_HEADER_SIZE + body.len()).ok()?;
        if compressed_size >= input_size {
            return None;
        }
        let header = CompressionHeader::new(CompressionAlgorithm::Deflate, input_size, compressed_size);
        let mut out = Vec::with_capacity(compressed_size as usize);
        header.write_to(&mut out);
        out.extend_from_slice(&body);
        Some(CompressedRevision { header, data: out })
    }

    fn expand(&self, header: &CompressionHeader, data: &[u8]) -> Result<Vec<u8>> {
        let end = (header.compressed_size as usize).min(data.len());
        if end < COMPRESSION_HEADER_SIZE {
            return Err(QvcsError::Format("deflate payload shorter than its header".into()));
        }
        let mut decoder = ZlibDecoder::new(&data[COMPRESSION_HEADER_SIZE..end]);
        let mut output = Vec::with_capacity(header.input_size as usize);
        decoder
            .read_to_end(&mut output)
            .map_err(|e| QvcsError::Format(format!("Zlib decompression failed: {e}")))?;
        if output.len() != header.input_size as usize {
            return Err(QvcsError::DecompressionMismatch {
                expected: header.input_size as usize,
                actual: output.len(),
            });
        }
        Ok(output)
    }
}
