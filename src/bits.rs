//! MSB-first bit cursor shared by all field codecs.
//!
//! Fields are consumed in declaration order and may be narrower than a byte;
//! consecutive fields pack into the same byte starting at its most
//! significant bit.

use crate::field::CodecError;

/// Widest field a single read or write may cover.
pub const MAX_FIELD_BITS: u8 = 32;

#[derive(Debug)]
pub struct BitReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    /// Bits consumed so far.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() * 8 - self.position
    }

    /// Read `width` bits as an unsigned value, most significant bit first.
    pub fn read(&mut self, width: u8) -> Result<u32, CodecError> {
        debug_assert!(width <= MAX_FIELD_BITS, "field width {} exceeds {}", width, MAX_FIELD_BITS);

        let needed = usize::from(width);
        if needed > self.remaining() {
            return Err(CodecError::BufferUnderrun {
                needed,
                available: self.remaining(),
            });
        }

        let mut value: u64 = 0;
        for _ in 0..needed {
            let byte = self.bytes[self.position / 8];
            let bit = (byte >> (7 - (self.position % 8))) & 1;
            value = (value << 1) | u64::from(bit);
            self.position += 1;
        }

        Ok(value as u32)
    }
}

#[derive(Debug, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    position: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Append the low `width` bits of `value`, most significant bit first.
    /// The caller guarantees `value < 2^width`.
    pub fn write(&mut self, value: u32, width: u8) {
        debug_assert!(width <= MAX_FIELD_BITS, "field width {} exceeds {}", width, MAX_FIELD_BITS);

        for shift in (0..width).rev() {
            if self.position % 8 == 0 {
                self.bytes.push(0);
            }
            let bit = ((u64::from(value) >> shift) & 1) as u8;
            if bit == 1 {
                let index = self.position / 8;
                self.bytes[index] |= 1 << (7 - (self.position % 8));
            }
            self.position += 1;
        }
    }

    /// Finished bytes; a trailing partial byte is zero padded.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_byte_fields_pack_msb_first() {
        let mut writer = BitWriter::new();
        writer.write(0b1, 1);
        writer.write(0b01, 2);
        writer.write(0b10110, 5);
        assert_eq!(writer.position(), 8);
        assert_eq!(writer.into_bytes(), vec![0b1011_0110]);
    }

    #[test]
    fn test_reads_cross_byte_boundaries() {
        let bytes = [0b1010_1010, 0b1100_0011];
        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read(4).unwrap(), 0b1010);
        assert_eq!(reader.read(8).unwrap(), 0b1010_1100);
        assert_eq!(reader.read(4).unwrap(), 0b0011);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_underrun_reports_missing_bits() {
        let bytes = [0xff];
        let mut reader = BitReader::new(&bytes);
        reader.read(6).unwrap();
        let err = reader.read(4).unwrap_err();
        assert!(matches!(err, CodecError::BufferUnderrun { needed: 4, available: 2 }));
        // A failed read does not move the cursor
        assert_eq!(reader.position(), 6);
    }

    #[test]
    fn test_full_width_values() {
        let mut writer = BitWriter::new();
        writer.write(u32::MAX, 32);
        let bytes = writer.into_bytes();
        assert_eq!(bytes, vec![0xff; 4]);
        assert_eq!(BitReader::new(&bytes).read(32).unwrap(), u32::MAX);
    }
}
