//! Cel assembly
//!
//! Each frame record carries a handful of cels: a 22-byte header followed by
//! one or more LZS or raw chunks of 8-bit pixels. Vertically scaled cels
//! store fewer rows than their full height and are expanded back by
//! nearest-neighbor row replication using an integer Bresenham accumulator.
//!
//! Cel pixel memory comes from a small pool: a few "fixed lifetime" buffers
//! preallocated to the container's declared maximum cel areas and reused
//! verbatim across frames, plus "frame lifetime" buffers that are
//! reallocated only when a cel outgrows its previous allocation.

use robot_common::{CelHeader, ChunkCompression, ChunkHeader, FormatError};
use robot_common::reader::ByteReader;
use tracing::trace;

use super::lzs;

/// Number of preallocated fixed-lifetime cel buffers
pub const FIXED_CEL_BUFFERS: usize = 4;

/// One decoded cel, borrowed from the pool for the duration of a frame
#[derive(Debug, Clone, Copy)]
pub struct CelSurface<'a> {
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
    /// `width * height` 8-bit palettized pixels, row-major
    pub pixels: &'a [u8],
}

/// Reusable cel pixel buffers
#[derive(Debug)]
pub struct CelPool {
    /// Fixed-lifetime buffers, capacities from the container header
    fixed: Vec<Vec<u8>>,
    /// Frame-lifetime buffers, grown on demand
    frame: Vec<Vec<u8>>,
    /// Scratch for the pre-expansion rows of scaled cels
    scaled_scratch: Vec<u8>,
}

impl CelPool {
    pub fn new(max_cel_area: [u32; 4]) -> Self {
        Self {
            fixed: max_cel_area
                .iter()
                .map(|&area| Vec::with_capacity(area as usize))
                .collect(),
            frame: Vec::new(),
            scaled_scratch: Vec::new(),
        }
    }

    /// Borrow the buffer for cel `index`, sized to `area` pixels
    ///
    /// The first [`FIXED_CEL_BUFFERS`] cels reuse their preallocated buffer
    /// when it is large enough; everything else falls back to a
    /// frame-lifetime buffer that is reallocated only when the required
    /// area exceeds its previous allocation.
    fn buffer_for(&mut self, index: usize, area: usize) -> &mut Vec<u8> {
        let buffer = if index < self.fixed.len() && area <= self.fixed[index].capacity() {
            &mut self.fixed[index]
        } else {
            if index >= self.frame.len() {
                self.frame.resize_with(index + 1, Vec::new);
            }
            if area > self.frame[index].capacity() {
                trace!("reallocating frame-lifetime cel buffer {index} to {area}");
            }
            &mut self.frame[index]
        };
        buffer.clear();
        buffer.resize(area, 0);
        buffer
    }
}

/// Decode the cel at the reader's position into the pool
///
/// Returns the parsed header; the pixels land in the pool buffer for
/// `cel_index` and are exposed through [`surface`]. The reader is left at
/// the start of the next cel.
pub fn decode_cel(
    reader: &mut ByteReader<'_>,
    pool: &mut CelPool,
    cel_index: usize,
) -> Result<CelHeader, FormatError> {
    let header = CelHeader::parse(reader)?;

    let width = header.width as usize;
    let full_height = header.height as usize;
    let scale = header.vertical_scale_factor as usize;
    let source_height = if scale == 100 {
        full_height
    } else if scale == 0 {
        return Err(FormatError::CorruptCel("zero vertical scale"));
    } else {
        full_height * scale / 100
    };

    // Assemble the stored rows, chunk by chunk.
    let source_area = width * source_height;
    let mut assembled = std::mem::take(&mut pool.scaled_scratch);
    assembled.clear();
    assembled.reserve(source_area);
    for _ in 0..header.num_chunks {
        let chunk = ChunkHeader::parse(reader)?;
        let payload = reader.bytes(chunk.compressed_size as usize)?;
        match chunk.compression {
            ChunkCompression::Lzs => {
                let decoded = lzs::decompress(payload, chunk.decompressed_size as usize)?;
                assembled.extend_from_slice(&decoded);
            }
            ChunkCompression::Uncompressed => assembled.extend_from_slice(payload),
        }
    }
    if assembled.len() != source_area {
        pool.scaled_scratch = assembled;
        return Err(FormatError::CorruptCel("chunk data does not cover the cel"));
    }

    let target = pool.buffer_for(cel_index, width * full_height);
    if source_height == full_height {
        target.copy_from_slice(&assembled);
    } else {
        expand_cel(target, &assembled, width, full_height, source_height);
    }
    pool.scaled_scratch = assembled;

    Ok(header)
}

/// Borrow the decoded surface for cel `cel_index` of the current frame
pub fn surface<'a>(pool: &'a CelPool, header: &CelHeader, cel_index: usize) -> CelSurface<'a> {
    let area = header.width as usize * header.height as usize;
    let pixels = if cel_index < pool.fixed.len() && area <= pool.fixed[cel_index].capacity() {
        &pool.fixed[cel_index][..area]
    } else {
        &pool.frame[cel_index][..area]
    };
    CelSurface {
        x: header.x,
        y: header.y,
        width: header.width,
        height: header.height,
        pixels,
    }
}

/// Expand `source_height` stored rows to `full_height` output rows
///
/// Integer Bresenham row replication: the accumulator decides how many
/// output rows each source row covers, so the mapping stays exact without
/// floating point. The accumulated quotients sum to exactly `full_height`.
fn expand_cel(
    target: &mut [u8],
    source: &[u8],
    width: usize,
    full_height: usize,
    source_height: usize,
) {
    let numerator = full_height;
    let denominator = source_height;
    let mut remainder = 0;
    let mut out_row = 0;

    for y in 0..source_height {
        remainder += numerator;
        let mut lines_to_draw = remainder / denominator;
        remainder %= denominator;

        let row = &source[y * width..(y + 1) * width];
        while lines_to_draw > 0 {
            target[out_row * width..(out_row + 1) * width].copy_from_slice(row);
            out_row += 1;
            lines_to_draw -= 1;
        }
    }
    debug_assert_eq!(out_row, full_height);
}

#[cfg(test)]
mod tests {
    use super::*;
    use robot_common::CEL_HEADER_SIZE;

    /// Serialize a cel with one uncompressed chunk
    fn raw_cel(width: u16, height: u16, scale: u8, pixels: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0u8; CEL_HEADER_SIZE];
        bytes[1] = scale;
        bytes[2..4].copy_from_slice(&width.to_le_bytes());
        bytes[4..6].copy_from_slice(&height.to_le_bytes());
        bytes[14..18].copy_from_slice(&((pixels.len() + 10) as u32).to_le_bytes());
        bytes[18..20].copy_from_slice(&1u16.to_le_bytes());

        bytes.extend_from_slice(&(pixels.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&(pixels.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes()); // uncompressed
        bytes.extend_from_slice(pixels);
        bytes
    }

    #[test]
    fn test_decode_unscaled_cel() {
        let pixels: Vec<u8> = (0..12).collect();
        let data = raw_cel(4, 3, 100, &pixels);
        let mut pool = CelPool::new([64, 64, 64, 64]);
        let mut reader = ByteReader::new(&data);

        let header = decode_cel(&mut reader, &mut pool, 0).unwrap();
        let cel = surface(&pool, &header, 0);
        assert_eq!(cel.width, 4);
        assert_eq!(cel.height, 3);
        assert_eq!(cel.pixels, &pixels[..]);
    }

    #[test]
    fn test_decode_scaled_cel_expands() {
        // 2 stored rows expand to 4 output rows at 50% vertical scale.
        let stored = [1u8, 1, 2, 2];
        let data = raw_cel(2, 4, 50, &stored);
        let mut pool = CelPool::new([64, 64, 64, 64]);
        let mut reader = ByteReader::new(&data);

        let header = decode_cel(&mut reader, &mut pool, 0).unwrap();
        let cel = surface(&pool, &header, 0);
        assert_eq!(cel.pixels, &[1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn test_expand_uneven_ratio() {
        // 3 rows to 4: Bresenham gives row duplication pattern 1,1,2.
        let source = [1u8, 2, 3];
        let mut target = [0u8; 4];
        expand_cel(&mut target, &source, 1, 4, 3);
        assert_eq!(target, [1, 2, 3, 3]);
    }

    #[test]
    fn test_pool_reuses_fixed_buffer() {
        let mut pool = CelPool::new([16, 16, 16, 16]);
        let ptr_a = pool.buffer_for(0, 8).as_ptr();
        let ptr_b = pool.buffer_for(0, 12).as_ptr();
        assert_eq!(ptr_a, ptr_b, "fixed buffer must be reused, not regrown");
    }

    #[test]
    fn test_pool_falls_back_to_frame_buffer() {
        let mut pool = CelPool::new([4, 4, 4, 4]);
        // Area exceeds the fixed allocation: a frame-lifetime buffer takes
        // over and persists across frames once grown.
        pool.buffer_for(0, 100);
        assert_eq!(pool.frame[0].len(), 100);
        pool.buffer_for(0, 60);
        assert!(pool.frame[0].capacity() >= 100);
    }

    #[test]
    fn test_short_chunk_data_rejected() {
        // Cel claims 4x3 = 12 pixels but its only chunk carries 6.
        let data = raw_cel(4, 3, 100, &[0u8; 6]);
        let mut pool = CelPool::new([64, 64, 64, 64]);
        let mut reader = ByteReader::new(&data);
        assert!(decode_cel(&mut reader, &mut pool, 0).is_err());
    }
}
