//! Column blocks and block index entries

use crate::compression::{self, BlockCompression};
use crate::{QuiverError, Result, SeriesId, TimeRange, Timestamp};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Fixed bytes before the timestamp column
const BLOCK_HEADER_SIZE: usize = 8 + 4 + 8 + 8 + 1 + 4;

/// Location and bounds of one block inside a part file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub series_id: SeriesId,
    pub first_timestamp: Timestamp,
    pub last_timestamp: Timestamp,
    pub offset: u64,
    pub size: u32,
    pub count: u32,
}

impl BlockRef {
    /// Encoded size in the part index
    pub const SIZE: usize = 8 + 8 + 8 + 8 + 4 + 4;

    pub fn overlaps(&self, range: &TimeRange) -> bool {
        self.first_timestamp <= range.end && self.last_timestamp >= range.start
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.series_id);
        buf.put_i64_le(self.first_timestamp);
        buf.put_i64_le(self.last_timestamp);
        buf.put_u64_le(self.offset);
        buf.put_u32_le(self.size);
        buf.put_u32_le(self.count);
    }

    pub(crate) fn decode(buf: &mut &[u8]) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(QuiverError::InvalidFormat("Block index entry truncated".into()));
        }
        Ok(Self {
            series_id: buf.get_u64_le(),
            first_timestamp: buf.get_i64_le(),
            last_timestamp: buf.get_i64_le(),
            offset: buf.get_u64_le(),
            size: buf.get_u32_le(),
            count: buf.get_u32_le(),
        })
    }
}

/// A decoded block: sorted samples of one series
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub series_id: SeriesId,
    pub timestamps: Vec<Timestamp>,
    pub values: Vec<f64>,
}

impl Block {
    /// Serialize columns into a checksummed block
    ///
    /// Format:
    /// - 8 bytes: series ID
    /// - 4 bytes: sample count
    /// - 8 bytes: first timestamp
    /// - 8 bytes: last timestamp
    /// - 1 byte: block compression
    /// - 4 bytes + N: timestamp column
    /// - 4 bytes + N: value column
    /// - 4 bytes: CRC32 of all of the above
    pub fn encode(
        series_id: SeriesId,
        timestamps: &[Timestamp],
        values: &[f64],
        compression: BlockCompression,
    ) -> Result<Bytes> {
        if timestamps.is_empty() || timestamps.len() != values.len() {
            return Err(QuiverError::Internal(format!(
                "cannot encode block with {} timestamps and {} values",
                timestamps.len(),
                values.len()
            )));
        }

        let ts_col = compression.compress(&compression::encode_timestamps(timestamps));
        let val_col = compression.compress(&compression::encode_values(values));

        let mut buf = BytesMut::with_capacity(BLOCK_HEADER_SIZE + ts_col.len() + val_col.len() + 8);
        buf.put_u64_le(series_id);
        buf.put_u32_le(timestamps.len() as u32);
        buf.put_i64_le(timestamps[0]);
        buf.put_i64_le(timestamps[timestamps.len() - 1]);
        buf.put_u8(compression as u8);
        buf.put_u32_le(ts_col.len() as u32);
        buf.put_slice(&ts_col);
        buf.put_u32_le(val_col.len() as u32);
        buf.put_slice(&val_col);

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        Ok(buf.freeze())
    }

    /// Verify the checksum and decode the columns
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < BLOCK_HEADER_SIZE + 4 + 4 {
            return Err(QuiverError::InvalidFormat("Block too short".into()));
        }

        let (body, mut crc) = data.split_at(data.len() - 4);
        let expected = crc.get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(QuiverError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let series_id = cursor.get_u64_le();
        let count = cursor.get_u32_le() as usize;
        let first_timestamp = cursor.get_i64_le();
        let last_timestamp = cursor.get_i64_le();
        let compression = BlockCompression::try_from(cursor.get_u8())?;

        let ts_col = take_column(&mut cursor)?;
        let val_col = take_column(&mut cursor)?;
        if cursor.has_remaining() {
            return Err(QuiverError::InvalidFormat("Trailing bytes in block".into()));
        }

        let timestamps = compression::decode_timestamps(&compression.decompress(ts_col)?, count)?;
        let values = compression::decode_values(&compression.decompress(val_col)?, count)?;

        if timestamps.first() != Some(&first_timestamp) || timestamps.last() != Some(&last_timestamp) {
            return Err(QuiverError::Corruption(format!(
                "block bounds [{}, {}] disagree with decoded timestamps",
                first_timestamp, last_timestamp
            )));
        }

        Ok(Self {
            series_id,
            timestamps,
            values,
        })
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

fn take_column<'a>(cursor: &mut &'a [u8]) -> Result<&'a [u8]> {
    if cursor.remaining() < 4 {
        return Err(QuiverError::InvalidFormat("Block column header truncated".into()));
    }
    let len = cursor.get_u32_le() as usize;
    if cursor.remaining() < len {
        return Err(QuiverError::InvalidFormat("Block column truncated".into()));
    }
    let current: &'a [u8] = *cursor;
    let (column, rest) = current.split_at(len);
    *cursor = rest;
    Ok(column)
}
