//! Robot packetized animation container (versions 5 and 6)
//!
//! A Robot file interleaves cel-based video frames with DPCM-compressed
//! audio blocks. Numeric fields are stored in the producing platform's byte
//! order; the magic word doubles as the byte-order probe.
//!
//! # Layout
//! ```text
//! 0x00: magic u16 (0x0016, detects endianness)
//! 0x02: signature "SOL\0"
//! 0x06: version u16 (5 or 6)
//! 0x08: audio block size u16
//! 0x0A: primer-zero-compress flag i16
//! 0x0C: reserved u16
//! 0x0E: frame count u16
//! 0x10: palette size u16
//! 0x12: primer reserved size u16
//! 0x14: x resolution i16
//! 0x16: y resolution i16
//! 0x18: has-palette u8
//! 0x19: has-audio u8
//! 0x1A: reserved u16
//! 0x1C: frame rate i16
//! 0x1E: hi-res flag i16
//! 0x20: max skippable packets i16
//! 0x22: max cels per frame i16
//! 0x24: max cel area u32 x4
//! 0x34: reserved (8 bytes)
//! ```
//!
//! Followed by: audio primer (header + payload, or zero-compressed sizes),
//! palette bytes, per-frame video/record size tables (u16 in v5, u32 in v6),
//! the 256-slot cue tables, then frame records starting at the next
//! 2048-byte boundary.
//!
//! Each frame record: u16 screen-item count, per-cel 22-byte headers plus
//! compressed chunk data, and (with audio) an 8-byte audio block header
//! (absolute stream position + compressed size) plus payload.

use crate::reader::{ByteReader, Endian};
use crate::FormatError;

/// Container magic word
pub const ROBOT_MAGIC: u16 = 0x16;

/// Container signature, immediately after the magic
pub const ROBOT_SIGNATURE: [u8; 4] = *b"SOL\0";

/// Fixed header size
pub const ROBOT_HEADER_SIZE: usize = 60;

/// Number of cue slots
pub const CUE_TABLE_SIZE: usize = 256;

/// Frame records start at the next multiple of this after the table section
pub const RECORD_ALIGNMENT: usize = 2048;

/// Per-cel header size within a frame record
pub const CEL_HEADER_SIZE: usize = 22;

/// Per-chunk header size within a cel
pub const CHUNK_HEADER_SIZE: usize = 10;

/// Audio block header size within a frame record
pub const AUDIO_BLOCK_HEADER_SIZE: usize = 8;

/// Even-channel primer size substituted when the primer is zero-compressed
pub const ZERO_COMPRESS_EVEN_SIZE: u32 = 19922;

/// Odd-channel primer size substituted when the primer is zero-compressed
pub const ZERO_COMPRESS_ODD_SIZE: u32 = 21024;

/// Fixed Robot container header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotHeader {
    pub version: u16,
    pub audio_block_size: u16,
    pub primer_zero_compress: bool,
    pub num_frames: u16,
    pub palette_size: u16,
    pub primer_reserved_size: u16,
    pub x_resolution: i16,
    pub y_resolution: i16,
    pub has_palette: bool,
    pub has_audio: bool,
    pub frame_rate: i16,
    pub is_hi_res: bool,
    pub max_skippable_packets: i16,
    pub max_cels_per_frame: i16,
    pub max_cel_area: [u32; 4],
}

impl RobotHeader {
    /// Parse the fixed header, detecting byte order from the magic word
    ///
    /// Leaves the reader positioned at [`ROBOT_HEADER_SIZE`] with the
    /// detected endianness set, ready for the primer section.
    pub fn parse(reader: &mut ByteReader<'_>) -> Result<Self, FormatError> {
        let magic = reader.u16()?;
        if magic != ROBOT_MAGIC {
            if magic.swap_bytes() == ROBOT_MAGIC {
                reader.set_endian(match reader.endian() {
                    Endian::Little => Endian::Big,
                    Endian::Big => Endian::Little,
                });
            } else {
                return Err(FormatError::BadMagic);
            }
        }

        if reader.bytes(4)? != ROBOT_SIGNATURE {
            return Err(FormatError::BadMagic);
        }

        let version = reader.u16()?;
        if !(5..=6).contains(&version) {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let audio_block_size = reader.u16()?;
        let primer_zero_compress = reader.i16()? != 0;
        reader.skip(2)?;
        let num_frames = reader.u16()?;
        let palette_size = reader.u16()?;
        let primer_reserved_size = reader.u16()?;
        let x_resolution = reader.i16()?;
        let y_resolution = reader.i16()?;
        let has_palette = reader.u8()? != 0;
        let has_audio = reader.u8()? != 0;
        reader.skip(2)?;
        let frame_rate = reader.i16()?;
        let is_hi_res = reader.i16()? != 0;
        let max_skippable_packets = reader.i16()?;
        let max_cels_per_frame = reader.i16()?;
        let max_cel_area = [reader.u32()?, reader.u32()?, reader.u32()?, reader.u32()?];
        reader.skip(8)?;

        debug_assert_eq!(reader.pos(), ROBOT_HEADER_SIZE);

        Ok(Self {
            version,
            audio_block_size,
            primer_zero_compress,
            num_frames,
            palette_size,
            primer_reserved_size,
            x_resolution,
            y_resolution,
            has_palette,
            has_audio,
            frame_rate,
            is_hi_res,
            max_skippable_packets,
            max_cels_per_frame,
            max_cel_area,
        })
    }
}

/// Audio primer header (present when the primer region is non-empty)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimerHeader {
    /// Size of the whole primer region including this header
    pub total_size: i32,
    /// Even-channel compressed payload size
    pub even_size: i32,
    /// Odd-channel compressed payload size
    pub odd_size: i32,
}

impl PrimerHeader {
    pub const SIZE: usize = 14;

    /// Parse the primer header. The compression tag must be 0; anything
    /// else means the container predates the supported format revisions.
    pub fn parse(reader: &mut ByteReader<'_>) -> Result<Self, FormatError> {
        let total_size = reader.i32()?;
        let compression_type = reader.i16()? as u16;
        if compression_type != 0 {
            return Err(FormatError::BadCompressionType(compression_type));
        }
        let even_size = reader.i32()?;
        let odd_size = reader.i32()?;

        if even_size < 0 || odd_size < 0 {
            return Err(FormatError::BadPrimer("negative channel size"));
        }

        Ok(Self {
            total_size,
            even_size,
            odd_size,
        })
    }
}

/// Cel compression tag within a chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkCompression {
    /// LZS (STAC) sliding-window compression
    Lzs,
    /// Raw pixel bytes
    Uncompressed,
}

impl TryFrom<u16> for ChunkCompression {
    type Error = FormatError;

    fn try_from(value: u16) -> Result<Self, FormatError> {
        match value {
            0 => Ok(Self::Lzs),
            2 => Ok(Self::Uncompressed),
            other => Err(FormatError::BadCompressionType(other)),
        }
    }
}

/// Per-cel header within a frame record (22 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CelHeader {
    /// Vertical scale percentage; 100 means unscaled, lower values mean the
    /// stored rows cover only part of the full cel height
    pub vertical_scale_factor: u8,
    pub width: u16,
    pub height: u16,
    pub x: i16,
    pub y: i16,
    /// Total chunk bytes following this header
    pub data_size: u32,
    pub num_chunks: u16,
}

impl CelHeader {
    pub fn parse(reader: &mut ByteReader<'_>) -> Result<Self, FormatError> {
        let start = reader.pos();
        reader.skip(1)?;
        let vertical_scale_factor = reader.u8()?;
        let width = reader.u16()?;
        let height = reader.u16()?;
        reader.skip(4)?;
        let x = reader.i16()?;
        let y = reader.i16()?;
        let data_size = reader.u32()?;
        let num_chunks = reader.u16()?;
        reader.seek(start + CEL_HEADER_SIZE)?;

        Ok(Self {
            vertical_scale_factor,
            width,
            height,
            x,
            y,
            data_size,
            num_chunks,
        })
    }
}

/// Per-chunk header within a cel (10 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub compressed_size: u32,
    pub decompressed_size: u32,
    pub compression: ChunkCompression,
}

impl ChunkHeader {
    pub fn parse(reader: &mut ByteReader<'_>) -> Result<Self, FormatError> {
        let compressed_size = reader.u32()?;
        let decompressed_size = reader.u32()?;
        let compression = ChunkCompression::try_from(reader.u16()?)?;

        Ok(Self {
            compressed_size,
            decompressed_size,
            compression,
        })
    }
}

/// Audio block header trailing a frame record (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAudioHeader {
    /// Absolute position in the expanded audio stream, in decompressed-byte
    /// units (always even; `% 4` selects the even/odd channel)
    pub position: i32,
    /// Compressed payload size in bytes
    pub size: i32,
}

impl FrameAudioHeader {
    pub fn parse(reader: &mut ByteReader<'_>) -> Result<Self, FormatError> {
        let position = reader.i32()?;
        let size = reader.i32()?;
        Ok(Self { position, size })
    }

    /// Whether this frame actually carries audio data
    pub fn is_present(&self) -> bool {
        self.size > 0
    }
}

/// Align a file position up to the next frame-record boundary
pub fn align_record_position(pos: usize) -> usize {
    pos.div_ceil(RECORD_ALIGNMENT) * RECORD_ALIGNMENT
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal valid 60-byte header, little-endian
    fn header_bytes() -> Vec<u8> {
        let mut b = vec![0u8; ROBOT_HEADER_SIZE];
        b[0..2].copy_from_slice(&ROBOT_MAGIC.to_le_bytes());
        b[2..6].copy_from_slice(&ROBOT_SIGNATURE);
        b[6..8].copy_from_slice(&5u16.to_le_bytes()); // version
        b[8..10].copy_from_slice(&1470u16.to_le_bytes()); // audio block size
        b[14..16].copy_from_slice(&2u16.to_le_bytes()); // frames
        b[20..22].copy_from_slice(&320u16.to_le_bytes()); // x res
        b[22..24].copy_from_slice(&240u16.to_le_bytes()); // y res
        b[28..30].copy_from_slice(&60u16.to_le_bytes()); // frame rate
        b[32..34].copy_from_slice(&1u16.to_le_bytes()); // max skippable
        b[34..36].copy_from_slice(&10u16.to_le_bytes()); // max cels
        b
    }

    #[test]
    fn test_parse_header() {
        let bytes = header_bytes();
        let mut reader = ByteReader::new(&bytes);
        let header = RobotHeader::parse(&mut reader).unwrap();

        assert_eq!(header.version, 5);
        assert_eq!(header.audio_block_size, 1470);
        assert_eq!(header.num_frames, 2);
        assert_eq!(header.x_resolution, 320);
        assert_eq!(header.frame_rate, 60);
        assert!(!header.has_audio);
        assert_eq!(reader.pos(), ROBOT_HEADER_SIZE);
    }

    #[test]
    fn test_parse_header_big_endian() {
        let mut bytes = header_bytes();
        // Swap every u16 field to big-endian (magic included)
        bytes[0..2].copy_from_slice(&ROBOT_MAGIC.to_be_bytes());
        bytes[6..8].copy_from_slice(&6u16.to_be_bytes());
        bytes[14..16].copy_from_slice(&2u16.to_be_bytes());
        bytes[8..10].copy_from_slice(&1470u16.to_be_bytes());
        bytes[20..22].copy_from_slice(&320u16.to_be_bytes());
        bytes[22..24].copy_from_slice(&240u16.to_be_bytes());
        bytes[28..30].copy_from_slice(&60u16.to_be_bytes());
        bytes[32..36].fill(0);

        let mut reader = ByteReader::new(&bytes);
        let header = RobotHeader::parse(&mut reader).unwrap();

        assert_eq!(reader.endian(), Endian::Big);
        assert_eq!(header.version, 6);
        assert_eq!(header.audio_block_size, 1470);
        assert_eq!(header.x_resolution, 320);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = header_bytes();
        bytes[0] = 0x17;
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(RobotHeader::parse(&mut reader), Err(FormatError::BadMagic));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = header_bytes();
        bytes[6..8].copy_from_slice(&4u16.to_le_bytes());
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(
            RobotHeader::parse(&mut reader),
            Err(FormatError::UnsupportedVersion(4))
        );
    }

    #[test]
    fn test_primer_rejects_compression() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&100i32.to_le_bytes());
        bytes.extend_from_slice(&1i16.to_le_bytes()); // bad compression tag
        bytes.extend_from_slice(&50i32.to_le_bytes());
        bytes.extend_from_slice(&36i32.to_le_bytes());

        let mut reader = ByteReader::new(&bytes);
        assert_eq!(
            PrimerHeader::parse(&mut reader),
            Err(FormatError::BadCompressionType(1))
        );
    }

    #[test]
    fn test_cel_header_roundtrip_offsets() {
        let mut bytes = vec![0u8; CEL_HEADER_SIZE];
        bytes[1] = 50; // vertical scale
        bytes[2..4].copy_from_slice(&64u16.to_le_bytes());
        bytes[4..6].copy_from_slice(&32u16.to_le_bytes());
        bytes[10..12].copy_from_slice(&10u16.to_le_bytes());
        bytes[12..14].copy_from_slice(&(-4i16).to_le_bytes());
        bytes[14..18].copy_from_slice(&1024u32.to_le_bytes());
        bytes[18..20].copy_from_slice(&2u16.to_le_bytes());

        let mut reader = ByteReader::new(&bytes);
        let cel = CelHeader::parse(&mut reader).unwrap();

        assert_eq!(cel.vertical_scale_factor, 50);
        assert_eq!(cel.width, 64);
        assert_eq!(cel.height, 32);
        assert_eq!(cel.x, 10);
        assert_eq!(cel.y, -4);
        assert_eq!(cel.data_size, 1024);
        assert_eq!(cel.num_chunks, 2);
        assert_eq!(reader.pos(), CEL_HEADER_SIZE);
    }

    #[test]
    fn test_chunk_compression_tags() {
        assert_eq!(ChunkCompression::try_from(0), Ok(ChunkCompression::Lzs));
        assert_eq!(
            ChunkCompression::try_from(2),
            Ok(ChunkCompression::Uncompressed)
        );
        assert_eq!(
            ChunkCompression::try_from(1),
            Err(FormatError::BadCompressionType(1))
        );
    }

    #[test]
    fn test_record_alignment() {
        assert_eq!(align_record_position(0), 0);
        assert_eq!(align_record_position(1), 2048);
        assert_eq!(align_record_position(2048), 2048);
        assert_eq!(align_record_position(2049), 4096);
    }
}
