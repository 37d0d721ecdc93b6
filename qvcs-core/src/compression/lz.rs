//! Hash-chained LZ compressor (algorithm id 1)
//!
//! Token stream layout after the compression header: a 2-byte control word
//! (low byte first) precedes every group of up to 16 tokens. Control bit `k`
//! set means token `k` is a back-reference of two bytes:
//!
//! ```text
//! byte0 = ((offset >> 4) & 0xF0) | (length - 1)
//! byte1 = offset & 0xFF
//! ```
//!
//! with `1 <= offset < 4096` and `3 <= length <= 16`. A clear bit means the
//! token is one literal byte. This layout is part of the archive format.

use super::{CompressedRevision, CompressionAlgorithm, CompressionHeader, Compressor, COMPRESSION_HEADER_SIZE};
use crate::error::{QvcsError, Result};

const HASH_TABLE_SIZE: usize = 4096;
const HASH_MASK: u32 = 0xFFF;
const HASH_MULTIPLIER: u32 = 40543;
/// Offsets must fit in 12 bits
const MAX_OFFSET: usize = 4095;
const MIN_MATCH: usize = 3;
const ITEM_MAX: usize = 16;
/// Bytes compared past the first three when extending a match
const EXTENSION_LIMIT: usize = ITEM_MAX - MIN_MATCH;
const TOKENS_PER_CONTROL_WORD: u32 = 16;

#[inline]
fn hash(b0: u8, b1: u8, b2: u8) -> usize {
    let mixed = ((((b0 as u32) << 4) ^ b1 as u32) << 4) ^ b2 as u32;
    ((HASH_MULTIPLIER.wrapping_mul(mixed) >> 4) & HASH_MASK) as usize
}

/// The LZ compressor. Stateless: each call allocates its own hash table.
#[derive(Debug, Clone, Copy, Default)]
pub struct LzCompressor;

impl LzCompressor {
    /// Length of the match between `input[pos..]` and `input[candidate..]`,
    /// or 0 when the first three bytes differ.
    fn match_length(input: &[u8], candidate: usize, pos: usize) -> usize {
        let walk = input[candidate..candidate + MIN_MATCH] == input[pos..pos + MIN_MATCH];
        if !walk {
            return 0;
        }
        let mut len = MIN_MATCH;
        while len < MIN_MATCH + EXTENSION_LIMIT && input[candidate + len] == input[pos + len] {
            len += 1;
        }
        len
    }

    /// Produce the token stream. Returns `None` as soon as the output would
    /// reach the input length.
    fn encode(input: &[u8]) -> Option<Vec<u8>> {
        let limit = input.len();
        let mut out = Vec::with_capacity(limit);
        out.resize(COMPRESSION_HEADER_SIZE, 0);

        let mut table: Vec<Option<usize>> = vec![None; HASH_TABLE_SIZE];
        let mut control: u16 = 0;
        let mut control_pos = 0usize;
        let mut tokens_in_group = TOKENS_PER_CONTROL_WORD;
        let mut pos = 0usize;

        while pos < input.len() {
            if tokens_in_group == TOKENS_PER_CONTROL_WORD {
                if control_pos != 0 {
                    out[control_pos..control_pos + 2].copy_from_slice(&control.to_le_bytes());
                }
                control_pos = out.len();
                out.extend_from_slice(&[0, 0]);
                control = 0;
                tokens_in_group = 0;
            }

            // Near the end there is no room for a full-length comparison.
            let mut emitted_reference = false;
            if pos + ITEM_MAX <= input.len() {
                let slot = hash(input[pos], input[pos + 1], input[pos + 2]);
                let candidate = table[slot].replace(pos);
                if let Some(candidate) = candidate {
                    let offset = pos - candidate;
                    if offset > 0 && offset <= MAX_OFFSET {
                        let len = Self::match_length(input, candidate, pos);
                        if len >= MIN_MATCH {
                            out.push((((offset >> 4) & 0xF0) | (len - 1)) as u8);
                            out.push((offset & 0xFF) as u8);
                            control |= 1 << tokens_in_group;
                            pos += len;
                            emitted_reference = true;
                        }
                    }
                }
            }
            if !emitted_reference {
                out.push(input[pos]);
                pos += 1;
            }
            tokens_in_group += 1;

            if out.len() >= limit {
                return None;
            }
        }

        if control_pos != 0 {
            out[control_pos..control_pos + 2].copy_from_slice(&control.to_le_bytes());
        }
        Some(out)
    }

    /// Decode a token stream starting after the header.
    fn decode(data: &[u8], expected: usize) -> Result<Vec<u8>> {
        let mut dst: Vec<u8> = Vec::with_capacity(expected);
        let mut src = COMPRESSION_HEADER_SIZE;
        let mut control: u32 = 0;
        let mut control_bits = 0u32;

        while src < data.len() {
            if control_bits == 0 {
                if src + 2 > data.len() {
                    return Err(QvcsError::Format("truncated LZ control word".into()));
                }
                control = data[src] as u32 | ((data[src + 1] as u32) << 8);
                src += 2;
                control_bits = TOKENS_PER_CONTROL_WORD;
                if src >= data.len() {
                    break;
                }
            }

            if control & 1 == 1 {
                if src + 2 > data.len() {
                    return Err(QvcsError::Format("truncated LZ back-reference".into()));
                }
                let b0 = data[src] as usize;
                let b1 = data[src + 1] as usize;
                src += 2;
                let offset = ((b0 & 0xF0) << 4) + b1;
                let len = 1 + (b0 & 0x0F);
                if offset == 0 || offset > dst.len() {
                    return Err(QvcsError::Format(format!(
                        "LZ back-reference offset {} outside {} decoded bytes",
                        offset,
                        dst.len()
                    )));
                }
                // Overlapping self-copy: a short offset repeats recent output.
                let start = dst.len() - offset;
                for i in 0..len {
                    let byte = dst[start + i];
                    dst.push(byte);
                }
            } else {
                dst.push(data[src]);
                src += 1;
            }

            if dst.len() > expected {
                return Err(QvcsError::DecompressionMismatch { expected, actual: dst.len() });
            }
            control >>= 1;
            control_bits -= 1;
        }

        if dst.len() != expected {
            return Err(QvcsError::DecompressionMismatch { expected, actual: dst.len() });
        }
        Ok(dst)
    }
}

impl Compressor for LzCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz
    }

    fn compress(&self, input: &[u8]) -> Option<CompressedRevision> {
        let input_size = u32::try_from(input.len()).ok()?;
        let mut out = Self::encode(input)?;
        let compressed_size = u32::try_from(out.len()).ok()?;
        if compressed_size >= input_size {
            return None;
        }
        let header = CompressionHeader::new(CompressionAlgorithm::Lz, input_size, compressed_size);
        let mut header_bytes = Vec::with_capacity(COMPRESSION_HEADER_SIZE);
        header.write_to(&mut header_bytes);
        out[..COMPRESSION_HEADER_SIZE].copy_from_slice(&header_bytes);
        Some(CompressedRevision { header, data: out })
    }

    fn expand(&self, header: &CompressionHeader, data: &[u8]) -> Result<Vec<u8>> {
        let end = (header.compressed_size as usize).min(data.len());
        Self::decode(&data[..end], header.input_size as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_matches_reference_values() {
        // (40543 * (((b0 << 4) ^ b1) << 4 ^ b2)) >> 4 & 0xFFF
        assert_eq!(hash(0, 0, 0), 0);
        let mixed: u32 = ((((b'a' as u32) << 4) ^ b'b' as u32) << 4) ^ b'c' as u32;
        assert_eq!(hash(b'a', b'b', b'c'), ((40543u32.wrapping_mul(mixed) >> 4) & 0xFFF) as usize);
    }

    #[test]
    fn test_run_of_one_byte_uses_overlapping_copy() {
        let input = vec![b'a'; 64];
        let compressed = LzCompressor.compress(&input).unwrap();
        // 1 literal, 3 references of 16 bytes, 15 trailing literals.
        assert_eq!(compressed.data.len(), COMPRESSION_HEADER_SIZE + 4 + 1 + 6 + 15);
        // First control word: token 0 literal, tokens 1..=3 references.
        let control = u16::from_le_bytes([compressed.data[10], compressed.data[11]]);
        assert_eq!(control & 0b1111, 0b1110);
        // First reference: offset 1, length 16.
        assert_eq!(compressed.data[13], 0x0F);
        assert_eq!(compressed.data[14], 0x01);

        let expanded = LzCompressor.expand(&compressed.header, &compressed.data).unwrap();
        assert_eq!(expanded, input);
    }

    #[test]
    fn test_incompressible_input_rejected() {
        let input: Vec<u8> = (0..=255u8).collect();
        assert!(LzCompressor.compress(&input).is_none());
    }

    #[test]
    fn test_size_mismatch_is_fatal() {
        let input = b"abcabcabcabcabcabcabcabcabcabcabcabcabcabc".to_vec();
        let compressed = LzCompressor.compress(&input).unwrap();
        let mut header = compressed.header;
        header.input_size += 1;
        let err = LzCompressor.expand(&header, &compressed.data).unwrap_err();
        assert!(matches!(err, QvcsError::DecompressionMismatch { .. }));
    }

    #[test]
    fn test_corrupt_offset_is_an_error_not_a_panic() {
        // header + control word (first token is a reference) + bogus reference
        let mut data = Vec::new();
        CompressionHeader::new(CompressionAlgorithm::Lz, 4, 14).write_to(&mut data);
        data.extend_from_slice(&[0x01, 0x00, 0x03, 0x10]);
        let header = CompressionHeader::read_from(&data).unwrap();
        assert!(LzCompressor.expand(&header, &data).is_err());
    }

    #[test]
    fn test_text_roundtrip() {
        let text = "fn main() {\n    println!(\"hello\");\n}\n".repeat(50);
        let compressed = LzCompressor.compress(text.as_bytes()).unwrap();
        assert!(compressed.data.len() < text.len());
        let expanded = LzCompressor.expand(&compressed.header, &compressed.data).unwrap();
        assert_eq!(expanded, text.as_bytes());
    }
}
