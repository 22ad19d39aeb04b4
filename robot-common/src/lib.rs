//! Shared types and utilities for the Robot multimedia subsystem
//!
//! This crate provides the binary format definitions shared between:
//! - `robot-player` (runtime decoder/scheduler and mixer)
//! - asset inspection tools
//!
//! # Modules
//!
//! - [`reader`] - Endian-aware, bounds-checked byte reader
//! - [`formats`] - Robot container and SOL audio resource formats

pub mod formats;
pub mod reader;

pub use reader::{ByteReader, Endian};

pub use formats::{
    AUDIO_BLOCK_HEADER_SIZE,
    CEL_HEADER_SIZE,
    CHUNK_HEADER_SIZE,
    CUE_TABLE_SIZE,
    CelHeader,
    ChunkCompression,
    ChunkHeader,
    FrameAudioHeader,
    PrimerHeader,
    RECORD_ALIGNMENT,
    ROBOT_HEADER_SIZE,
    ROBOT_MAGIC,
    ROBOT_SIGNATURE,
    RobotHeader,
    SOL_SIGNATURE,
    SignatureKind,
    SolHeader,
    ZERO_COMPRESS_EVEN_SIZE,
    ZERO_COMPRESS_ODD_SIZE,
    align_record_position,
    decode_sol_payload,
    detect_signature,
    sol_flags,
};

/// Errors produced while parsing Robot or SOL binary data
///
/// All variants are fatal for the operation that produced them: the caller
/// aborts the open/decode, never the process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// Magic word or signature mismatch
    #[error("bad magic: not a Robot/SOL resource")]
    BadMagic,

    /// Container version outside the supported range
    #[error("unsupported Robot version {0} (must be 5 or 6)")]
    UnsupportedVersion(u16),

    /// Data ended before a complete field/table/record
    #[error("truncated data at offset {0}")]
    Truncated(usize),

    /// Unknown compression tag in a primer or cel chunk header
    #[error("bad compression type {0}")]
    BadCompressionType(u16),

    /// Primer sizes inconsistent with the reserved primer region
    #[error("corrupt audio primer: {0}")]
    BadPrimer(&'static str),

    /// LZS stream with an impossible back-reference or length
    #[error("corrupt LZS data at output byte {0}")]
    CorruptLzs(usize),

    /// Cel header fields that cannot describe a decodable cel
    #[error("corrupt cel: {0}")]
    CorruptCel(&'static str),
}
