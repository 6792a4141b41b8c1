//! Bit-level I/O for the column codecs

/// Bit writer, most significant bit first
#[derive(Debug)]
pub struct BitWriter {
    buffer: Vec<u8>,
    current_byte: u8,
    bit_position: u8,
}

impl BitWriter {
    /// Create with capacity hint in bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            current_byte: 0,
            bit_position: 0,
        }
    }

    #[inline]
    pub fn write_bit(&mut self, bit: bool) {
        self.write_bits(bit as u64, 1);
    }

    /// Write the low `num_bits` bits of `value`
    #[inline]
    pub fn write_bits(&mut self, value: u64, num_bits: u32) {
        debug_assert!(num_bits <= 64);

        let mut remaining = num_bits;
        while remaining > 0 {
            let free = 8 - self.bit_position as u32;
            let take = free.min(remaining);
            let shift = remaining - take;
            let chunk = ((value >> shift) & ((1u64 << take) - 1)) as u8;

            self.current_byte |= chunk << (free - take);
            self.bit_position += take as u8;
            remaining -= take;

            if self.bit_position == 8 {
                self.buffer.push(self.current_byte);
                self.current_byte = 0;
                self.bit_position = 0;
            }
        }
    }

    /// Finish writing and return the buffer, padding the last byte with zeros
    pub fn finish(mut self) -> Vec<u8> {
        if self.bit_position > 0 {
            self.buffer.push(self.current_byte);
        }
        self.buffer
    }
}

/// Bit reader over a borrowed buffer
#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_position: usize,
    bit_position: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_position: 0,
            bit_position: 0,
        }
    }

    /// Read `num_bits` bits as an unsigned integer; `None` past the end of data
    #[inline]
    pub fn read_bits(&mut self, num_bits: u32) -> Option<u64> {
        debug_assert!(num_bits <= 64);

        let mut value = 0u64;
        let mut remaining = num_bits;
        while remaining > 0 {
            let byte = *self.data.get(self.byte_position)?;
            let avail = 8 - self.bit_position as u32;
            let take = avail.min(remaining);
            let mask = ((1u16 << take) - 1) as u8;
            let chunk = (byte >> (avail - take)) & mask;

            value = (value << take) | chunk as u64;
            self.bit_position += take as u8;
            remaining -= take;

            if self.bit_position == 8 {
                self.byte_position += 1;
                self.bit_position = 0;
            }
        }
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_prefixes_pack_msb_first() {
        let mut writer = BitWriter::with_capacity(4);
        writer.write_bit(false);
        writer.write_bits(0b10, 2);
        writer.write_bits(0b110, 3);
        writer.write_bits(0b1111, 4);

        // 0 10 110 11 | 11 + zero padding
        assert_eq!(writer.finish(), vec![0b0101_1011, 0b1100_0000]);
    }

    #[test]
    fn test_unaligned_wide_values() {
        let mut writer = BitWriter::with_capacity(32);

        writer.write_bits(0b111, 3);
        writer.write_bits(u64::MAX, 64);
        writer.write_bits(0xDEADBEEF, 32);
        writer.write_bits(0, 5);

        let data = writer.finish();
        assert_eq!(data.len(), 13);
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bits(3), Some(0b111));
        assert_eq!(reader.read_bits(64), Some(u64::MAX));
        assert_eq!(reader.read_bits(32), Some(0xDEADBEEF));
        assert_eq!(reader.read_bits(5), Some(0));
    }

    #[test]
    fn test_read_past_end() {
        let data = [0xAB];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bits(4), Some(0xA));
        assert_eq!(reader.read_bits(4), Some(0xB));
        assert_eq!(reader.read_bits(1), None);
    }
}
