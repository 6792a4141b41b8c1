//! Column codecs for time-series blocks
//!
//! Timestamps and values of a series are stored as two separate columns,
//! following the Gorilla paper ("Gorilla: A Fast, Scalable, In-Memory Time
//! Series Database"):
//!
//! - timestamps: delta-of-delta with variable-width buckets
//! - values: XOR against the previous value with a leading/trailing zero window
//!
//! A block may additionally be wrapped in LZ4.

mod bitstream;
mod timestamp;
mod value;

pub use bitstream::{BitReader, BitWriter};
pub use timestamp::{decode_timestamps, encode_timestamps, TimestampDecoder, TimestampEncoder};
pub use value::{decode_values, encode_values, ValueDecoder, ValueEncoder};

use crate::{QuiverError, Result};
use serde::{Deserialize, Serialize};

/// Block-level compression applied on top of the column codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockCompression {
    None = 0,
    Lz4 = 1,
}

impl Default for BlockCompression {
    fn default() -> Self {
        BlockCompression::Lz4
    }
}

impl TryFrom<u8> for BlockCompression {
    type Error = QuiverError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(BlockCompression::None),
            1 => Ok(BlockCompression::Lz4),
            _ => Err(QuiverError::InvalidFormat(format!(
                "Invalid block compression: {}",
                value
            ))),
        }
    }
}

impl BlockCompression {
    pub fn compress(self, data: &[u8]) -> Vec<u8> {
        match self {
            BlockCompression::None => data.to_vec(),
            BlockCompression::Lz4 => lz4_flex::compress_prepend_size(data),
        }
    }

    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            BlockCompression::None => Ok(data.to_vec()),
            BlockCompression::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| QuiverError::Compression(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lz4_wrapping() {
        let timestamps: Vec<i64> = (0..2000).map(|i| i * 1000).collect();
        let column = encode_timestamps(&timestamps);

        let packed = BlockCompression::Lz4.compress(&column);
        let unpacked = BlockCompression::Lz4.decompress(&packed).unwrap();
        assert_eq!(unpacked, column);

        assert!(BlockCompression::Lz4.decompress(&[4, 0, 0, 0, 0xff]).is_err());
        assert!(BlockCompression::try_from(9).is_err());
    }
}
