//! XOR float column codec

use super::bitstream::{BitReader, BitWriter};
use crate::{QuiverError, Result};

/// Largest leading-zero count representable in the 5-bit window header
const MAX_LEADING_ZEROS: u32 = 31;

/// Encodes a float column by XOR-ing each value with its predecessor
///
/// * `0` - value identical to the previous one
/// * `10` + meaningful bits - XOR fits inside the previous window
/// * `11` + 5 bits leading zeros + 6 bits (meaningful - 1) + meaningful bits
pub struct ValueEncoder {
    writer: BitWriter,
    count: usize,
    prev_bits: u64,
    /// (leading zeros, trailing zeros) of the current window
    window: Option<(u32, u32)>,
}

impl ValueEncoder {
    pub fn with_capacity(points: usize) -> Self {
        Self {
            writer: BitWriter::with_capacity(8 + points),
            count: 0,
            prev_bits: 0,
            window: None,
        }
    }

    pub fn encode(&mut self, value: f64) {
        let bits = value.to_bits();
        if self.count == 0 {
            self.writer.write_bits(bits, 64);
        } else {
            self.encode_xor(bits ^ self.prev_bits);
        }
        self.prev_bits = bits;
        self.count += 1;
    }

    fn encode_xor(&mut self, xor: u64) {
        if xor == 0 {
            self.writer.write_bit(false);
            return;
        }
        self.writer.write_bit(true);

        let leading = xor.leading_zeros().min(MAX_LEADING_ZEROS);
        let trailing = xor.trailing_zeros();

        match self.window {
            Some((prev_leading, prev_trailing))
                if leading >= prev_leading && trailing >= prev_trailing =>
            {
                self.writer.write_bit(false);
                let meaningful = 64 - prev_leading - prev_trailing;
                self.writer.write_bits(xor >> prev_trailing, meaningful);
            }
            _ => {
                self.writer.write_bit(true);
                let meaningful = 64 - leading - trailing;
                self.writer.write_bits(leading as u64, 5);
                self.writer.write_bits((meaningful - 1) as u64, 6);
                self.writer.write_bits(xor >> trailing, meaningful);
                self.window = Some((leading, trailing));
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

/// Decodes a column produced by [`ValueEncoder`]
pub struct ValueDecoder<'a> {
    reader: BitReader<'a>,
    remaining: usize,
    decoded: usize,
    prev_bits: u64,
    window: (u32, u32),
}

impl<'a> ValueDecoder<'a> {
    pub fn new(data: &'a [u8], count: usize) -> Self {
        Self {
            reader: BitReader::new(data),
            remaining: count,
            decoded: 0,
            prev_bits: 0,
            window: (0, 0),
        }
    }

    pub fn decode_next(&mut self) -> Result<Option<f64>> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let bits = if self.decoded == 0 {
            self.bits(64)?
        } else if self.bits(1)? == 0 {
            self.prev_bits
        } else {
            if self.bits(1)? == 1 {
                let leading = self.bits(5)? as u32;
                let meaningful = self.bits(6)? as u32 + 1;
                if leading + meaningful > 64 {
                    return Err(QuiverError::Compression(format!(
                        "invalid XOR window: {} leading, {} meaningful",
                        leading, meaningful
                    )));
                }
                self.window = (leading, 64 - leading - meaningful);
            }
            let (leading, trailing) = self.window;
            let meaningful = 64 - leading - trailing;
            let xor = self.bits(meaningful)? << trailing;
            self.prev_bits ^ xor
        };

        self.prev_bits = bits;
        self.decoded += 1;
        self.remaining -= 1;
        Ok(Some(f64::from_bits(bits)))
    }

    fn bits(&mut self, n: u32) -> Result<u64> {
        self.reader.read_bits(n).ok_or_else(|| {
            QuiverError::Compression(format!(
                "value column truncated after {} values",
                self.decoded
            ))
        })
    }
}

/// Encode a whole value column
pub fn encode_values(values: &[f64]) -> Vec<u8> {
    let mut encoder = ValueEncoder::with_capacity(values.len());
    for &v in values {
        encoder.encode(v);
    }
    encoder.finish()
}

/// Decode `count` values
pub fn decode_values(data: &[u8], count: usize) -> Result<Vec<f64>> {
    let mut decoder = ValueDecoder::new(data, count);
    let mut out = Vec::with_capacity(count);
    while let Some(v) = decoder.decode_next()? {
        out.push(v);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_bitwise_eq(a: &[f64], b: &[f64]) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert_eq!(x.to_bits(), y.to_bits(), "value mismatch at {}: {} vs {}", i, x, y);
        }
    }

    #[test]
    fn test_constant_values() {
        let values = vec![42.0; 500];
        let data = encode_values(&values);

        // raw first value plus one bit per repeat
        assert_eq!(data.len(), 8 + (499 + 7) / 8);
        assert_bitwise_eq(&decode_values(&data, values.len()).unwrap(), &values);
    }

    #[test]
    fn test_wide_xor_window() {
        // sign flips and tiny numbers need a 64-bit meaningful window and
        // leading zero counts above 31
        let values = vec![
            1.0,
            -1.0,
            f64::MIN_POSITIVE,
            5e-324,
            f64::MAX,
            0.0,
            -0.0,
            f64::INFINITY,
            f64::NAN,
            1.0000000000000002,
            1.0,
        ];
        let data = encode_values(&values);
        assert_bitwise_eq(&decode_values(&data, values.len()).unwrap(), &values);
    }

    #[test]
    fn test_gauge_like_series() {
        let values: Vec<f64> = (0..1000).map(|i| 20.0 + (i as f64 * 0.1).sin() * 5.0).collect();
        let data = encode_values(&values);

        assert!(data.len() < values.len() * 8);
        assert_bitwise_eq(&decode_values(&data, values.len()).unwrap(), &values);
    }
}
