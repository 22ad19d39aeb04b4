//! SOL audio resource format
//!
//! DPCM-compressed raw audio, used both for standalone sample resources and
//! (headerless) for Robot audio tracks.
//!
//! # Layout
//! ```text
//! 0x00: signature "SOL\0"
//! 0x04: sample rate u16 LE
//! 0x06: flags u8
//! 0x07: payload size i32 LE   <- omitted in the 7-byte header variant
//! ```
//!
//! The short 7-byte variant (used by one demo-era game) has no size field;
//! the payload size is the resource size minus the header.

use tracing::warn;

use crate::FormatError;
use crate::reader::ByteReader;

/// SOL resource signature
pub const SOL_SIGNATURE: [u8; 4] = *b"SOL\0";

/// SOL header flags
pub mod sol_flags {
    /// Payload is DPCM compressed
    pub const COMPRESSED: u8 = 0x01;
    /// Samples are 16-bit (8-bit unsigned otherwise)
    pub const PCM_16BIT: u8 = 0x04;
    /// Uncompressed 8-bit samples are signed rather than excess-128
    pub const PCM_SIGNED: u8 = 0x08;
}

/// Resource kind detected by signature sniffing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    /// SOL header (long or short variant)
    Sol,
    /// RIFF/WAVE container
    Wave,
    /// No recognizable header; treated as raw PCM
    Raw,
}

/// Sniff the first bytes of an audio resource
pub fn detect_signature(data: &[u8]) -> SignatureKind {
    if data.len() >= 4 && data[0..4] == SOL_SIGNATURE {
        SignatureKind::Sol
    } else if data.len() >= 4 && &data[0..4] == b"RIFF" {
        SignatureKind::Wave
    } else {
        SignatureKind::Raw
    }
}

/// Parsed SOL resource header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolHeader {
    pub sample_rate: u16,
    pub flags: u8,
    /// Payload size in bytes
    pub data_size: u32,
    /// Size of the header itself (7 or 11 bytes)
    pub header_size: usize,
}

impl SolHeader {
    /// Parse a SOL header from the start of `data`
    ///
    /// `resource_size` is the total resource size, used to recover the
    /// payload size for the short header variant and to clamp declared
    /// sizes that run past the end of the resource.
    pub fn parse(data: &[u8], resource_size: usize) -> Result<Self, FormatError> {
        let mut reader = ByteReader::new(data);
        if reader.bytes(4)? != SOL_SIGNATURE {
            return Err(FormatError::BadMagic);
        }
        let sample_rate = reader.u16()?;
        let flags = reader.u8()?;

        // The short variant ends here; probe for the size field.
        let (data_size, header_size) = if data.len() >= 11 {
            let declared = reader.i32()?;
            if declared < 0 {
                return Err(FormatError::Truncated(7));
            }
            ((declared as u32).min(resource_size.saturating_sub(11) as u32), 11)
        } else {
            ((resource_size.saturating_sub(7)) as u32, 7)
        };

        Ok(Self {
            sample_rate,
            flags,
            data_size,
            header_size,
        })
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & sol_flags::COMPRESSED != 0
    }

    pub fn is_16bit(&self) -> bool {
        self.flags & sol_flags::PCM_16BIT != 0
    }

    pub fn is_signed(&self) -> bool {
        self.flags & sol_flags::PCM_SIGNED != 0
    }
}

/// Recenter an excess-128 sample to signed 16-bit
#[inline]
fn recenter_u8(sample: u8) -> i16 {
    ((sample as i16) - 128) << 8
}

/// Decode a SOL payload to mono signed 16-bit PCM
///
/// Handles all flag combinations: DPCM-compressed or raw, 8- or 16-bit,
/// signed or excess-128. Raw 16-bit payloads are read little-endian. An odd
/// trailing byte in a 16-bit payload is dropped with a warning.
pub fn decode_sol_payload(header: &SolHeader, payload: &[u8]) -> Vec<i16> {
    let payload = if payload.len() > header.data_size as usize {
        &payload[..header.data_size as usize]
    } else {
        payload
    };

    match (header.is_compressed(), header.is_16bit()) {
        (true, true) => {
            let mut carry = 0i16;
            sol_dpcm::decode16_vec(payload, &mut carry)
        }
        (true, false) => {
            let mut carry = 0u8;
            sol_dpcm::decode8_vec(payload, &mut carry)
                .into_iter()
                .map(recenter_u8)
                .collect()
        }
        (false, true) => {
            if payload.len() % 2 != 0 {
                warn!("SOL 16-bit payload has odd length {}", payload.len());
            }
            payload
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect()
        }
        (false, false) => {
            if header.is_signed() {
                payload.iter().map(|&b| (b as i8 as i16) << 8).collect()
            } else {
                payload.iter().map(|&b| recenter_u8(b)).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sol_resource(flags: u8, payload: &[u8], short: bool) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&SOL_SIGNATURE);
        data.extend_from_slice(&22050u16.to_le_bytes());
        data.push(flags);
        if !short {
            data.extend_from_slice(&(payload.len() as i32).to_le_bytes());
        }
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn test_parse_long_header() {
        let data = sol_resource(sol_flags::COMPRESSED | sol_flags::PCM_16BIT, &[0; 32], false);
        let header = SolHeader::parse(&data, data.len()).unwrap();
        assert_eq!(header.sample_rate, 22050);
        assert_eq!(header.header_size, 11);
        assert_eq!(header.data_size, 32);
        assert!(header.is_compressed());
        assert!(header.is_16bit());
    }

    #[test]
    fn test_parse_short_header() {
        let data = sol_resource(0, &[1, 2, 3], true);
        let header = SolHeader::parse(&data, data.len()).unwrap();
        assert_eq!(header.header_size, 7);
        assert_eq!(header.data_size, 3);
    }

    #[test]
    fn test_detect() {
        assert_eq!(detect_signature(b"SOL\0abc"), SignatureKind::Sol);
        assert_eq!(detect_signature(b"RIFFxxxxWAVE"), SignatureKind::Wave);
        assert_eq!(detect_signature(&[0x12, 0x34, 0x56, 0x78]), SignatureKind::Raw);
        assert_eq!(detect_signature(&[]), SignatureKind::Raw);
    }

    #[test]
    fn test_decode_raw_unsigned_8bit() {
        let data = sol_resource(0, &[128, 255, 0], false);
        let header = SolHeader::parse(&data, data.len()).unwrap();
        let pcm = decode_sol_payload(&header, &data[header.header_size..]);
        assert_eq!(pcm, vec![0, 127 << 8, -128 << 8]);
    }

    #[test]
    fn test_decode_raw_16bit() {
        let payload: Vec<u8> = [100i16, -200, 300]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let data = sol_resource(sol_flags::PCM_16BIT, &payload, false);
        let header = SolHeader::parse(&data, data.len()).unwrap();
        let pcm = decode_sol_payload(&header, &data[header.header_size..]);
        assert_eq!(pcm, vec![100, -200, 300]);
    }

    #[test]
    fn test_decode_dpcm16() {
        // 0x01 = +8 steps, decoded by the sol-dpcm tables
        let data = sol_resource(
            sol_flags::COMPRESSED | sol_flags::PCM_16BIT,
            &[0x01, 0x01],
            false,
        );
        let header = SolHeader::parse(&data, data.len()).unwrap();
        let pcm = decode_sol_payload(&header, &data[header.header_size..]);
        assert_eq!(pcm, vec![8, 16]);
    }

    #[test]
    fn test_declared_size_clamped() {
        let mut data = sol_resource(sol_flags::PCM_16BIT, &[0; 4], false);
        // Lie about the payload size
        data[7..11].copy_from_slice(&1000i32.to_le_bytes());
        let header = SolHeader::parse(&data, data.len()).unwrap();
        assert_eq!(header.data_size, 4);
    }

    #[test]
    fn test_bad_signature() {
        assert_eq!(
            SolHeader::parse(b"WAV\0aaaaaaa", 11),
            Err(FormatError::BadMagic)
        );
    }
}
