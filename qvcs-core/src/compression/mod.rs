//! Revision payload compression
//!
//! Every compressed revision starts with a 10-byte [`CompressionHeader`]
//! naming the algorithm that produced it. Decompression dispatches on that
//! id, so both algorithms must stay readable for as long as archives written
//! with them exist.

mod deflate;
mod lz;

pub use deflate::DeflateCompressor;
pub use lz::LzCompressor;

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::ArchiveReader;
use crate::error::{QvcsError, Result};

/// Size of the serialized compression header
pub const COMPRESSION_HEADER_SIZE: usize = 10;

/// Algorithm ids stored in the compression header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CompressionAlgorithm {
    /// Hash-chained LZ compressor (id 1)
    #[default]
    Lz,
    /// zlib-framed deflate (id 2)
    Deflate,
}

impl CompressionAlgorithm {
    pub fn id(self) -> u16 {
        match self {
            CompressionAlgorithm::Lz => 1,
            CompressionAlgorithm::Deflate => 2,
        }
    }

    pub fn from_id(id: u16) -> Result<Self> {
        match id {
            1 => Ok(CompressionAlgorithm::Lz),
            2 => Ok(CompressionAlgorithm::Deflate),
            other => Err(QvcsError::UnknownCompression(other)),
        }
    }
}

/// Header prepended to every compressed revision payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionHeader {
    /// Length of the original (uncompressed) buffer
    pub input_size: u32,
    /// Length of the compressed buffer, header included
    pub compressed_size: u32,
    pub algorithm: CompressionAlgorithm,
}

impl CompressionHeader {
    pub fn new(algorithm: CompressionAlgorithm, input_size: u32, compressed_size: u32) -> Self {
        Self { input_size, compressed_size, algorithm }
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.put_u32_le(self.input_size);
        buf.put_u32_le(self.compressed_size);
        buf.put_u16_le(self.algorithm.id());
    }

    /// Parse the header at the front of a compressed payload
    pub fn read_from(data: &[u8]) -> Result<Self> {
        let mut reader = ArchiveReader::new(data);
        let input_size = reader.read_u32()?;
        let compressed_size = reader.read_u32()?;
        let algorithm = CompressionAlgorithm::from_id(reader.read_u16()?)?;
        Ok(Self { input_size, compressed_size, algorithm })
    }
}

/// Output of a successful compression: the header plus the full payload
/// (header bytes included) ready to be stored as revision data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedRevision {
    pub header: CompressionHeader,
    pub data: Vec<u8>,
}

/// Compression contract shared by both algorithms
///
/// Implementations hold no per-call state, so one instance may be shared.
pub trait Compressor: Send + Sync {
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Compress `input`. Returns `None` when the result would not be smaller
    /// than the input; the caller then stores the revision uncompressed.
    fn compress(&self, input: &[u8]) -> Option<CompressedRevision>;

    /// Reverse `compress`. `data` is the full payload including the header.
    fn expand(&self, header: &CompressionHeader, data: &[u8]) -> Result<Vec<u8>>;
}

/// Get the compressor implementing an algorithm
pub fn compressor_for(algorithm: CompressionAlgorithm) -> Box<dyn Compressor> {
    match algorithm {
        CompressionAlgorithm::Lz => Box::new(LzCompressor),
        CompressionAlgorithm::Deflate => Box::new(DeflateCompressor::default()),
    }
}

/// Compress with the chosen algorithm, enforcing `compressed_size <= input_size`
pub fn compress(algorithm: CompressionAlgorithm, input: &[u8]) -> Option<CompressedRevision> {
    let compressed = compressor_for(algorithm).compress(input)?;
    if compressed.header.compressed_size > compressed.header.input_size
        || compressed.data.len() != compressed.header.compressed_size as usize
    {
        debug!(
            "Discarding {:?} compression result: {} -> {} bytes",
            algorithm,
            input.len(),
            compressed.data.len()
        );
        return None;
    }
    Some(compressed)
}

/// Expand a stored payload, dispatching on the algorithm id in its header
pub fn expand(data: &[u8]) -> Result<Vec<u8>> {
    let header = CompressionHeader::read_from(data)?;
    compressor_for(header.algorithm).expand(&header, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn repetitive(len: usize) -> Vec<u8> {
        b"The quick brown fox jumps over the lazy dog. "
            .iter()
            .cycle()
            .take(len)
            .copied()
            .collect()
    }

    #[test]
    fn test_header_roundtrip() {
        let header = CompressionHeader::new(CompressionAlgorithm::Deflate, 1000, 120);
        let mut buf = Vec::new();
        header.write_to(&mut buf);
        assert_eq!(buf.len(), COMPRESSION_HEADER_SIZE);
        assert_eq!(CompressionHeader::read_from(&buf).unwrap(), header);
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let mut buf = Vec::new();
        buf.put_u32_le(10);
        buf.put_u32_le(10);
        buf.put_u16_le(9);
        assert!(matches!(
            CompressionHeader::read_from(&buf),
            Err(QvcsError::UnknownCompression(9))
        ));
    }

    #[test]
    fn test_dispatch_by_header_id() {
        let input = repetitive(4096);
        for algorithm in [CompressionAlgorithm::Lz, CompressionAlgorithm::Deflate] {
            let compressed = compress(algorithm, &input).unwrap();
            assert_eq!(compressed.header.algorithm, algorithm);
            assert_eq!(expand(&compressed.data).unwrap(), input);
        }
    }

    #[test]
    fn test_empty_and_tiny_buffers_not_compressed() {
        for algorithm in [CompressionAlgorithm::Lz, CompressionAlgorithm::Deflate] {
            assert!(compress(algorithm, b"").is_none());
            assert!(compress(algorithm, b"x").is_none());
        }
    }

    proptest! {
        #[test]
        fn prop_compression_roundtrip(input in proptest::collection::vec(any::<u8>(), 0..4096), lz in any::<bool>()) {
            let algorithm = if lz { CompressionAlgorithm::Lz } else { CompressionAlgorithm::Deflate };
            match compress(algorithm, &input) {
                Some(compressed) => {
                    prop_assert!(compressed.header.compressed_size <= compressed.header.input_size);
                    prop_assert_eq!(compressed.header.input_size as usize, input.len());
                    prop_assert_eq!(expand(&compressed.data).unwrap(), input);
                }
                None => {
                    // Stored as-is; nothing to expand.
                }
            }
        }

        #[test]
        fn prop_repetitive_input_compresses(seed in proptest::collection::vec(any::<u8>(), 1..8), repeats in 64usize..512) {
            let input: Vec<u8> = seed.iter().cycle().take(seed.len() * repeats).copied().collect();
            let compressed = compress(CompressionAlgorithm::Lz, &input).unwrap();
            prop_assert_eq!(expand(&compressed.data).unwrap(), input);
        }
    }
}
