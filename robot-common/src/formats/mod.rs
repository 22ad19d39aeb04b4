//! Robot-specific binary formats
//!
//! - [`robot`] - the Robot packetized animation container (v5/v6)
//! - [`sol`] - the SOL DPCM-compressed audio resource

pub mod robot;
pub mod sol;

pub use robot::{
    AUDIO_BLOCK_HEADER_SIZE, CEL_HEADER_SIZE, CHUNK_HEADER_SIZE, CUE_TABLE_SIZE, CelHeader,
    ChunkCompression, ChunkHeader, FrameAudioHeader, PrimerHeader, RECORD_ALIGNMENT,
    ROBOT_HEADER_SIZE, ROBOT_MAGIC, ROBOT_SIGNATURE, RobotHeader, ZERO_COMPRESS_EVEN_SIZE,
    ZERO_COMPRESS_ODD_SIZE, align_record_position,
};
pub use sol::{SOL_SIGNATURE, SignatureKind, SolHeader, decode_sol_payload, detect_signature, sol_flags};
