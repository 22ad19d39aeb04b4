//! LZS (STAC) cel chunk decompression
//!
//! Bit-oriented sliding-window scheme, MSB first:
//! - control bit 0: one literal byte follows
//! - control bit 1: a back-reference follows; the next bit selects a 7-bit
//!   (1) or 11-bit (0) offset, and a 7-bit offset of zero terminates the
//!   stream
//! - copy length: 2 bits give 2/3/4; the escape value leads to 2 more bits
//!   for 5/6/7, whose escape in turn starts at 8 and accumulates nibbles
//!   for as long as each nibble is 15

use robot_common::FormatError;

/// MSB-first bit reader over a byte slice
struct BitReader<'a> {
    data: &'a [u8],
    byte_pos: usize,
    bit_pos: u8,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_pos: 0,
            bit_pos: 0,
        }
    }

    fn bits(&mut self, count: u8) -> Result<u32, FormatError> {
        debug_assert!(count <= 16);
        let mut value = 0u32;
        for _ in 0..count {
            let byte = *self
                .data
                .get(self.byte_pos)
                .ok_or(FormatError::Truncated(self.byte_pos))?;
            let bit = (byte >> (7 - self.bit_pos)) & 1;
            value = (value << 1) | bit as u32;
            self.bit_pos += 1;
            if self.bit_pos == 8 {
                self.bit_pos = 0;
                self.byte_pos += 1;
            }
        }
        Ok(value)
    }

    fn byte(&mut self) -> Result<u8, FormatError> {
        Ok(self.bits(8)? as u8)
    }
}

/// Read one copy-length code
fn copy_length(bits: &mut BitReader<'_>) -> Result<usize, FormatError> {
    Ok(match bits.bits(2)? {
        0 => 2,
        1 => 3,
        2 => 4,
        _ => match bits.bits(2)? {
            0 => 5,
            1 => 6,
            2 => 7,
            _ => {
                let mut len = 8usize;
                loop {
                    let nibble = bits.bits(4)? as usize;
                    len += nibble;
                    if nibble != 0xF {
                        break len;
                    }
                }
            }
        },
    })
}

/// Decompress one LZS stream
///
/// `expected_size` comes from the chunk header; a stream that terminates at
/// any other length, or back-references data before the start of output, is
/// corrupt.
pub fn decompress(input: &[u8], expected_size: usize) -> Result<Vec<u8>, FormatError> {
    let mut bits = BitReader::new(input);
    let mut out = Vec::with_capacity(expected_size);

    loop {
        if bits.bits(1)? == 1 {
            let offset = if bits.bits(1)? == 1 {
                let offset = bits.bits(7)? as usize;
                if offset == 0 {
                    // End marker
                    break;
                }
                offset
            } else {
                bits.bits(11)? as usize
            };

            if offset == 0 || offset > out.len() {
                return Err(FormatError::CorruptLzs(out.len()));
            }

            let length = copy_length(&mut bits)?;
            if out.len() + length > expected_size {
                return Err(FormatError::CorruptLzs(out.len()));
            }
            // Byte-by-byte so a reference may overlap its own output
            // (run-length style copies rely on this).
            let start = out.len() - offset;
            for i in 0..length {
                let byte = out[start + i];
                out.push(byte);
            }
        } else {
            if out.len() >= expected_size {
                return Err(FormatError::CorruptLzs(out.len()));
            }
            let byte = bits.byte()?;
            out.push(byte);
        }
    }

    if out.len() != expected_size {
        return Err(FormatError::CorruptLzs(out.len()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bit-level LZS stream builder for tests
    #[derive(Default)]
    struct BitWriter {
        bytes: Vec<u8>,
        bit_pos: u8,
    }

    impl BitWriter {
        fn push_bits(&mut self, value: u32, count: u8) {
            for i in (0..count).rev() {
                if self.bit_pos == 0 {
                    self.bytes.push(0);
                }
                let bit = ((value >> i) & 1) as u8;
                let last = self.bytes.last_mut().unwrap();
                *last |= bit << (7 - self.bit_pos);
                self.bit_pos = (self.bit_pos + 1) % 8;
            }
        }

        fn literal(&mut self, byte: u8) {
            self.push_bits(0, 1);
            self.push_bits(byte as u32, 8);
        }

        fn copy(&mut self, offset: u32, length: usize) {
            self.push_bits(1, 1);
            if offset < 128 {
                self.push_bits(1, 1);
                self.push_bits(offset, 7);
            } else {
                self.push_bits(0, 1);
                self.push_bits(offset, 11);
            }
            match length {
                2..=4 => self.push_bits(length as u32 - 2, 2),
                5..=7 => {
                    self.push_bits(3, 2);
                    self.push_bits(length as u32 - 5, 2);
                }
                _ => {
                    self.push_bits(3, 2);
                    self.push_bits(3, 2);
                    let mut rest = length - 8;
                    while rest >= 0xF {
                        self.push_bits(0xF, 4);
                        rest -= 0xF;
                    }
                    self.push_bits(rest as u32, 4);
                }
            }
        }

        fn finish(mut self) -> Vec<u8> {
            // End marker: 7-bit offset of zero
            self.push_bits(1, 1);
            self.push_bits(1, 1);
            self.push_bits(0, 7);
            self.bytes
        }
    }

    #[test]
    fn test_literals_only() {
        let mut w = BitWriter::default();
        for b in b"robot" {
            w.literal(*b);
        }
        let out = decompress(&w.finish(), 5).unwrap();
        assert_eq!(out, b"robot");
    }

    #[test]
    fn test_back_reference() {
        let mut w = BitWriter::default();
        for b in b"abc" {
            w.literal(*b);
        }
        w.copy(3, 3); // repeat "abc"
        let out = decompress(&w.finish(), 6).unwrap();
        assert_eq!(out, b"abcabc");
    }

    #[test]
    fn test_overlapping_run() {
        let mut w = BitWriter::default();
        w.literal(b'x');
        w.copy(1, 7); // offset 1, length 7: run of x
        let out = decompress(&w.finish(), 8).unwrap();
        assert_eq!(out, b"xxxxxxxx");
    }

    #[test]
    fn test_long_length_nibbles() {
        // Length 40 = 8 + 15 + 15 + 2 exercises the nibble accumulator.
        let mut w = BitWriter::default();
        w.literal(0xAB);
        w.copy(1, 40);
        let out = decompress(&w.finish(), 41).unwrap();
        assert_eq!(out, vec![0xAB; 41]);
    }

    #[test]
    fn test_wrong_expected_size_rejected() {
        let mut w = BitWriter::default();
        w.literal(1);
        w.literal(2);
        let data = w.finish();
        assert!(decompress(&data, 3).is_err());
        assert!(decompress(&data, 1).is_err());
    }

    #[test]
    fn test_bad_offset_rejected() {
        let mut w = BitWriter::default();
        w.literal(1);
        w.copy(5, 2); // references before the start of output
        assert!(decompress(&w.finish(), 3).is_err());
    }

    #[test]
    fn test_truncated_stream_rejected() {
        assert!(decompress(&[], 1).is_err());
        // A literal control bit with no byte behind it.
        assert!(decompress(&[0x00], 4).is_err());
    }
}
