//! Delta-of-delta timestamp column codec

use super::bitstream::{BitReader, BitWriter};
use crate::{QuiverError, Result, Timestamp};

/// Encodes a timestamp column
///
/// The first timestamp is written raw. Each following timestamp is stored as
/// the difference between its delta and the previous delta, bucketed by
/// magnitude:
///
/// | prefix | payload | delta-of-delta range |
/// |--------|---------|----------------------|
/// | `0`    | -       | 0                    |
/// | `10`   | 7 bits  | [-63, 64]            |
/// | `110`  | 9 bits  | [-255, 256]          |
/// | `1110` | 12 bits | [-2047, 2048]        |
/// | `1111` | 64 bits | anything else        |
pub struct TimestampEncoder {
    writer: BitWriter,
    count: usize,
    prev_timestamp: Timestamp,
    prev_delta: i64,
}

impl TimestampEncoder {
    pub fn with_capacity(points: usize) -> Self {
        Self {
            writer: BitWriter::with_capacity(8 + points / 4),
            count: 0,
            prev_timestamp: 0,
            prev_delta: 0,
        }
    }

    pub fn encode(&mut self, timestamp: Timestamp) {
        if self.count == 0 {
            self.writer.write_bits(timestamp as u64, 64);
        } else {
            let delta = timestamp.wrapping_sub(self.prev_timestamp);
            let dod = delta.wrapping_sub(self.prev_delta);
            self.write_dod(dod);
            self.prev_delta = delta;
        }
        self.prev_timestamp = timestamp;
        self.count += 1;
    }

    fn write_dod(&mut self, dod: i64) {
        match dod {
            0 => self.writer.write_bit(false),
            -63..=64 => {
                self.writer.write_bits(0b10, 2);
                self.writer.write_bits((dod + 63) as u64, 7);
            }
            -255..=256 => {
                self.writer.write_bits(0b110, 3);
                self.writer.write_bits((dod + 255) as u64, 9);
            }
            -2047..=2048 => {
                self.writer.write_bits(0b1110, 4);
                self.writer.write_bits((dod + 2047) as u64, 12);
            }
            _ => {
                self.writer.write_bits(0b1111, 4);
                self.writer.write_bits(dod as u64, 64);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn finish(self) -> Vec<u8> {
        self.writer.finish()
    }
}

/// Decodes a column produced by [`TimestampEncoder`]
pub struct TimestampDecoder<'a> {
    reader: BitReader<'a>,
    remaining: usize,
    decoded: usize,
    prev_timestamp: Timestamp,
    prev_delta: i64,
}

impl<'a> TimestampDecoder<'a> {
    pub fn new(data: &'a [u8], count: usize) -> Self {
        Self {
            reader: BitReader::new(data),
            remaining: count,
            decoded: 0,
            prev_timestamp: 0,
            prev_delta: 0,
        }
    }

    pub fn decode_next(&mut self) -> Result<Option<Timestamp>> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let timestamp = if self.decoded == 0 {
            self.bits(64)? as i64
        } else {
            let dod = self.read_dod()?;
            let delta = self.prev_delta.wrapping_add(dod);
            self.prev_delta = delta;
            self.prev_timestamp.wrapping_add(delta)
        };

        self.prev_timestamp = timestamp;
        self.decoded += 1;
        self.remaining -= 1;
        Ok(Some(timestamp))
    }

    fn read_dod(&mut self) -> Result<i64> {
        if self.bits(1)? == 0 {
            return Ok(0);
        }
        if self.bits(1)? == 0 {
            return Ok(self.bits(7)? as i64 - 63);
        }
        if self.bits(1)? == 0 {
            return Ok(self.bits(9)? as i64 - 255);
        }
        if self.bits(1)? == 0 {
            return Ok(self.bits(12)? as i64 - 2047);
        }
        Ok(self.bits(64)? as i64)
    }

    fn bits(&mut self, n: u32) -> Result<u64> {
        self.reader.read_bits(n).ok_or_else(|| {
            QuiverError::Compression(format!(
                "timestamp column truncated after {} values",
                self.decoded
            ))
        })
    }
}

/// Encode a whole timestamp column
pub fn encode_timestamps(timestamps: &[Timestamp]) -> Vec<u8> {
    let mut encoder = TimestampEncoder::with_capacity(timestamps.len());
    for &ts in timestamps {
        encoder.encode(ts);
    }
    encoder.finish()
}

/// Decode `count` timestamps
pub fn decode_timestamps(data: &[u8], count: usize) -> Result<Vec<Timestamp>> {
    let mut decoder = TimestampDecoder::new(data, count);
    let mut out = Vec::with_capacity(count);
    while let Some(ts) = decoder.decode_next()? {
        out.push(ts);
    }
    Ok(out)
}
