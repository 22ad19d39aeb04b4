//! Robust Robot audio ring buffer
//!
//! Robot audio arrives as DPCM16-compressed packets belonging to two
//! half-rate sub-streams ("even" and "odd" - stream positions divisible by 4
//! versus positions with remainder 2). This buffer accepts those packets
//! out of order, possibly overlapping and possibly only partially writable,
//! and presents them to the mixer as one continuous full-rate PCM stream.
//!
//! Position arithmetic:
//! - Packet positions and all cursors are byte positions in the *expanded*
//!   stream: each decoded i16 sample of a half-rate sub-stream occupies one
//!   2-byte slot every 4 bytes, interleaved with the other sub-stream
//!   ([`EXPANSION`] = 2).
//! - `read_head_abs <= write_head_abs <= max_write_abs` always holds;
//!   `max_write_abs - read_head_abs` is the ring capacity.
//! - `joint_min[phase]` is the per-phase high-water mark of *real* (not
//!   interpolated) data; it never decreases.
//!
//! Regions already read, or already covered by real data of the packet's own
//! phase, are silently discarded on resubmission - duplicate and overlapping
//! packets are harmless. A packet extending beyond the writable window is
//! applied partially and reported with `false` so the caller resubmits it
//! later; the already-written prefix is then skipped by the same clipping.

use std::sync::Mutex;

use tracing::{debug, trace, warn};

/// Robot audio sample rate of the full-rate (interleaved) stream
pub const ROBOT_SAMPLE_RATE: u32 = 22050;

/// Bytes of expanded stream per byte of decompressed half-rate PCM
pub const EXPANSION: i64 = 2;

/// One compressed audio packet extracted from a Robot container
#[derive(Debug, Clone, Copy)]
pub struct RobotAudioPacket<'a> {
    /// Absolute expanded-stream byte position (always even)
    pub position: i64,
    /// DPCM16-compressed payload (one sample per byte)
    pub data: &'a [u8],
}

impl<'a> RobotAudioPacket<'a> {
    pub fn new(position: i64, data: &'a [u8]) -> Self {
        Self { position, data }
    }

    /// Expanded-stream byte range covered by this packet
    fn end_byte(&self) -> i64 {
        self.position + self.data.len() as i64 * 2 * EXPANSION
    }

    /// Sub-stream selector: 0 for positions divisible by 4, 1 otherwise
    fn phase(&self) -> usize {
        usize::from(self.position % 4 != 0)
    }
}

/// Dual-phase ring buffer reconciling the two Robot audio sub-streams
pub struct RobotAudioStream {
    inner: Mutex<StreamInner>,
}

struct StreamInner {
    /// Ring storage, one i16 slot per 2 bytes of expanded stream
    loop_buffer: Vec<i16>,
    /// Ring capacity in expanded-stream bytes
    buffer_bytes: i64,
    /// Decompression scratch, reused across packets
    decompression_buffer: Vec<i16>,
    /// Position of the packet currently held in the scratch buffer
    decompression_position: Option<i64>,
    read_head_abs: i64,
    write_head_abs: i64,
    max_write_abs: i64,
    joint_min: [i64; 2],
    first_packet_position: Option<i64>,
    waiting: bool,
    finished: bool,
}

impl RobotAudioStream {
    /// Create a stream with `buffer_size` bytes of expanded-stream capacity
    /// (must be a multiple of 4 so both phases wrap identically)
    pub fn new(buffer_size: usize) -> Self {
        assert!(buffer_size > 0 && buffer_size % 4 == 0);
        Self {
            inner: Mutex::new(StreamInner {
                loop_buffer: vec![0; buffer_size / 2],
                buffer_bytes: buffer_size as i64,
                decompression_buffer: Vec::new(),
                decompression_position: None,
                read_head_abs: 0,
                write_head_abs: 0,
                max_write_abs: buffer_size as i64,
                joint_min: [0, 2],
                first_packet_position: None,
                waiting: true,
                finished: false,
            }),
        }
    }

    /// Submit one compressed packet
    ///
    /// Returns `true` when the packet is fully consumed (including the
    /// degenerate cases: duplicate of already-written data, or entirely
    /// behind the read cursor). Returns `false` when the buffer is full or
    /// the packet was only partially applied; the caller must resubmit the
    /// same packet later.
    pub fn add_packet(&self, packet: RobotAudioPacket<'_>) -> bool {
        let mut s = self.inner.lock().unwrap();

        if s.finished {
            warn!("packet at {} after finish; ignored", packet.position);
            return true;
        }

        // Positions are always even; an odd position means corrupt data and
        // the packet cannot be phase-classified. Discard it.
        if packet.position % 2 != 0 {
            warn!("discarding packet at odd position {}", packet.position);
            return true;
        }

        let phase = packet.phase();

        // The first packet establishes the stream origin. Primer packets
        // start at positions 0 and 2; a mid-stream resume starts wherever
        // the resume point landed.
        if s.first_packet_position.is_none() {
            s.reset_to(packet.position);
            s.fill(&packet, phase);
            return true;
        }

        // Entirely stale: every byte is behind the read cursor or behind
        // this phase's real data. No mutation.
        if packet.end_byte() <= s.read_head_abs.max(s.joint_min[phase]) {
            trace!("stale packet at {} discarded", packet.position);
            return true;
        }

        // Buffer full for this phase; caller retries after the mixer drains.
        if s.max_write_abs <= s.joint_min[phase] {
            return false;
        }

        s.fill(&packet, phase);

        // Partial write: the tail ran past the writable window.
        if packet.end_byte() > s.max_write_abs {
            return false;
        }

        // Two-primer handshake: the second distinct packet means both
        // phases have data and playback may start.
        if s.waiting && s.first_packet_position != Some(packet.position) {
            debug!("second primer at {}; stream ready", packet.position);
            s.waiting = false;
        }

        true
    }

    /// Pull decoded full-rate samples for the mixer
    ///
    /// Returns 0 while the two-primer handshake is incomplete. Otherwise
    /// copies up to `out.len()` samples, advancing the read cursor and the
    /// writable window together.
    pub fn read_buffer(&self, out: &mut [i16]) -> usize {
        let mut s = self.inner.lock().unwrap();

        if s.waiting {
            return 0;
        }

        let available = ((s.write_head_abs - s.read_head_abs) / 2) as usize;
        let n = out.len().min(available);
        for (i, sample) in out.iter_mut().take(n).enumerate() {
            let slot = s.slot_index(s.read_head_abs + 2 * i as i64);
            *sample = s.loop_buffer[slot];
        }
        s.read_head_abs += 2 * n as i64;
        s.max_write_abs += 2 * n as i64;
        n
    }

    /// No more packets will be submitted
    pub fn finish(&self) {
        self.inner.lock().unwrap().finished = true;
    }

    /// Fully drained after [`finish`](Self::finish)
    pub fn is_finished(&self) -> bool {
        let s = self.inner.lock().unwrap();
        s.finished && s.read_head_abs >= s.write_head_abs
    }

    /// Still waiting for the two-primer handshake
    pub fn is_waiting(&self) -> bool {
        self.inner.lock().unwrap().waiting
    }

    /// Absolute expanded-stream byte position of playback (bytes played)
    pub fn bytes_played(&self) -> i64 {
        self.inner.lock().unwrap().read_head_abs
    }
}

impl StreamInner {
    /// Ring slot for an expanded-stream byte position (always even)
    fn slot_index(&self, position: i64) -> usize {
        debug_assert!(position >= 0 && position % 2 == 0);
        ((position % self.buffer_bytes) / 2) as usize
    }

    /// Smallest position `>= from` that belongs to `phase`
    fn phase_align(from: i64, phase: usize) -> i64 {
        let target = phase as i64 * 2;
        from + (target - from).rem_euclid(4)
    }

    /// Reset cursors for the first packet of a (re)started stream
    fn reset_to(&mut self, position: i64) {
        let base = position & !3;
        self.read_head_abs = base;
        self.write_head_abs = base;
        self.max_write_abs = base + self.buffer_bytes;
        self.joint_min = [base, base + 2];
        self.first_packet_position = Some(position);
        self.waiting = true;
        self.finished = false;
        debug!("audio stream primed at {} (base {})", position, base);
    }

    /// Decompress (if not already cached) and write the packet's samples
    /// into the ring, clipped to the currently writable window, then fill
    /// any gaps the write opened up and advance the write frontier.
    fn fill(&mut self, packet: &RobotAudioPacket<'_>, phase: usize) {
        // Resubmissions of a partially applied packet hit the scratch cache.
        if self.decompression_position != Some(packet.position) {
            self.decompression_buffer.resize(packet.data.len(), 0);
            let mut carry = 0i16;
            sol_dpcm::decode16(packet.data, &mut self.decompression_buffer, &mut carry);
            self.decompression_position = Some(packet.position);
        }

        let decompressed_bytes = packet.data.len() as i64 * 2;
        let mut position = packet.position;
        let mut num_bytes = decompressed_bytes;
        let mut source_byte = 0i64;

        // Clip the front: skip everything already read or already written
        // with real data for this phase.
        let start_byte =
            Self::phase_align(self.read_head_abs, phase).max(self.joint_min[phase]);
        if position < start_byte {
            source_byte = (start_byte - position) / EXPANSION;
            num_bytes -= source_byte;
            position = start_byte;
        }

        // Clip the tail to the writable window. Phase 1 slots sit 2 bytes
        // past their phase-0 neighbors, so its window shifts by 2.
        let max_write_byte = self.max_write_abs + phase as i64 * 2;
        if position > max_write_byte {
            num_bytes = 0;
        } else if position + num_bytes * EXPANSION > max_write_byte {
            num_bytes = (max_write_byte - position) / EXPANSION;
        }

        let num_samples = (num_bytes / 2).max(0) as usize;
        if num_samples == 0 {
            return;
        }

        let src_start = (source_byte / 2) as usize;
        for i in 0..num_samples {
            let slot = self.slot_index(position + 4 * i as i64);
            self.loop_buffer[slot] = self.decompression_buffer[src_start + i];
        }

        let end_byte = position + num_samples as i64 * 2 * EXPANSION;

        // Interpolate slots the other phase has not delivered yet, so the
        // reader always sees a fully populated region below the frontier.
        // The frontier itself never passes the capacity limit: a phase-1
        // write may end 2 bytes past it, but that last slot still lies
        // within the ring.
        let joint_min_other = self.joint_min[1 - phase];
        let old_frontier = self.write_head_abs;
        let new_frontier = end_byte.min(self.max_write_abs);
        if new_frontier > old_frontier {
            self.fill_missing(old_frontier, new_frontier, position, phase, joint_min_other);
            self.write_head_abs = new_frontier;
        }

        self.joint_min[phase] = self.joint_min[phase].max(end_byte);
    }

    /// Populate every slot in `[from, to)` that holds neither real data nor
    /// bytes of the packet just written, using the documented 2-tap average
    /// of its neighbors (neighbor copy at the leading edge).
    fn fill_missing(
        &mut self,
        from: i64,
        to: i64,
        written_start: i64,
        written_phase: usize,
        joint_min_other: i64,
    ) {
        let mut t = from;
        while t < to {
            let phase = usize::from(t % 4 != 0);
            let populated = if phase == written_phase {
                (t >= written_start && t < to) || t < self.joint_min[phase]
            } else {
                t < joint_min_other
            };
            if !populated {
                // The walk is ascending, so the slot below is always
                // populated (or already interpolated) except at the very
                // start of the stream.
                let prev = if t >= 2 {
                    Some(self.loop_buffer[self.slot_index(t - 2)])
                } else {
                    None
                };
                let next = if t + 2 < to {
                    Some(self.loop_buffer[self.slot_index(t + 2)])
                } else {
                    None
                };
                let value = match (prev, next) {
                    (Some(p), Some(n)) => ((p as i32 + n as i32) / 2) as i16,
                    (Some(p), None) => p,
                    (None, Some(n)) => n,
                    (None, None) => 0,
                };
                let slot = self.slot_index(t);
                self.loop_buffer[slot] = value;
            }
            t += 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// DPCM16 bytes that decode to a +8 staircase (each 0x01 adds step 8)
    fn staircase(n: usize) -> Vec<u8> {
        vec![0x01; n]
    }

    /// Decode helper mirroring what the stream does internally
    fn decoded(n: usize) -> Vec<i16> {
        let mut carry = 0;
        sol_dpcm::decode16_vec(&staircase(n), &mut carry)
    }

    fn primed_stream(samples_per_primer: usize) -> RobotAudioStream {
        let stream = RobotAudioStream::new(1024);
        assert!(stream.add_packet(RobotAudioPacket::new(0, &staircase(samples_per_primer))));
        assert!(stream.is_waiting());
        assert!(stream.add_packet(RobotAudioPacket::new(2, &staircase(samples_per_primer))));
        assert!(!stream.is_waiting());
        stream
    }

    #[test]
    fn test_waiting_until_two_primers() {
        let stream = RobotAudioStream::new(1024);
        let mut out = [0i16; 8];

        assert_eq!(stream.read_buffer(&mut out), 0);
        stream.add_packet(RobotAudioPacket::new(0, &staircase(4)));
        assert_eq!(stream.read_buffer(&mut out), 0, "one primer is not enough");
        stream.add_packet(RobotAudioPacket::new(2, &staircase(4)));
        assert!(stream.read_buffer(&mut out) > 0);
    }

    #[test]
    fn test_interleaves_phases() {
        let stream = primed_stream(4);
        let mut out = [0i16; 8];
        assert_eq!(stream.read_buffer(&mut out), 8);

        // Both primers decode to the same staircase, so the interleaved
        // full-rate stream pairs each value.
        let d = decoded(4);
        assert_eq!(out, [d[0], d[0], d[1], d[1], d[2], d[2], d[3], d[3]]);
    }

    #[test]
    fn test_duplicate_packet_is_noop() {
        let stream = primed_stream(8);

        // Resubmit the even primer verbatim, then read: output must be
        // identical to a clean run.
        assert!(stream.add_packet(RobotAudioPacket::new(0, &staircase(8))));
        let mut out = [0i16; 16];
        assert_eq!(stream.read_buffer(&mut out), 16);

        let d = decoded(8);
        for i in 0..8 {
            assert_eq!(out[2 * i], d[i]);
            assert_eq!(out[2 * i + 1], d[i]);
        }
    }

    #[test]
    fn test_duplicate_after_read_does_not_corrupt() {
        let stream = primed_stream(8);
        // Primers cover 16 paired samples plus one interpolated tail slot.
        let mut first = [0i16; 17];
        assert_eq!(stream.read_buffer(&mut first), 17);

        // The region is fully read; a duplicate must be discarded and no
        // new data may appear.
        assert!(stream.add_packet(RobotAudioPacket::new(0, &staircase(8))));
        let mut again = [0i16; 4];
        assert_eq!(stream.read_buffer(&mut again), 0);
    }

    #[test]
    fn test_backpressure_and_partial_write() {
        // Small buffer: 16 full-rate samples (32 bytes expanded).
        let stream = RobotAudioStream::new(32);
        assert!(stream.add_packet(RobotAudioPacket::new(0, &staircase(4))));
        assert!(stream.add_packet(RobotAudioPacket::new(2, &staircase(4))));
        assert!(!stream.is_waiting());

        // A packet twice the remaining window: applied partially.
        let big = staircase(8);
        assert!(!stream.add_packet(RobotAudioPacket::new(16, &big)));

        // The phase is now saturated; resubmission is refused outright
        // until the mixer drains something.
        assert!(!stream.add_packet(RobotAudioPacket::new(16, &big)));

        // Drain a little: the resubmission applies a further slice but
        // still cannot finish.
        let mut out = [0i16; 4];
        assert_eq!(stream.read_buffer(&mut out), 4);
        assert!(!stream.add_packet(RobotAudioPacket::new(16, &big)));

        // Drain more; the final resubmission completes.
        let mut out = [0i16; 8];
        assert_eq!(stream.read_buffer(&mut out), 8);
        assert!(stream.add_packet(RobotAudioPacket::new(16, &big)));
    }

    #[test]
    fn test_joint_min_monotone() {
        let stream = RobotAudioStream::new(64);
        let packets: [(i64, usize); 4] = [(0, 4), (2, 4), (16, 4), (2, 2)];

        let mut last = [i64::MIN; 2];
        for (pos, n) in packets {
            stream.add_packet(RobotAudioPacket::new(pos, &staircase(n)));
            let s = stream.inner.lock().unwrap();
            for phase in 0..2 {
                assert!(s.joint_min[phase] >= last[phase]);
                last[phase] = s.joint_min[phase];
            }
        }
    }

    #[test]
    fn test_gap_interpolation() {
        let stream = RobotAudioStream::new(1024);
        stream.add_packet(RobotAudioPacket::new(0, &staircase(2)));
        // Even phase runs ahead: packet at 16 leaves odd slots 10 and 14
        // unwritten; they must be interpolated, not stay zero... but first
        // prime the odd phase so playback starts.
        stream.add_packet(RobotAudioPacket::new(2, &staircase(2)));
        stream.add_packet(RobotAudioPacket::new(16, &staircase(2)));

        let mut out = [0i16; 12];
        let n = stream.read_buffer(&mut out);
        assert_eq!(n, 12);
        // Slots beyond the odd primer's coverage hold interpolated values:
        // never the zero fill of an untouched ring.
        let tail = &out[5..];
        assert!(tail.iter().any(|&s| s != 0), "gap was not interpolated");
    }

    #[test]
    fn test_finish_and_drain() {
        let stream = primed_stream(4);
        assert!(!stream.is_finished());
        stream.finish();
        assert!(!stream.is_finished(), "not drained yet");

        // Primers cover 8 paired samples plus one interpolated tail slot.
        let mut out = [0i16; 9];
        assert_eq!(stream.read_buffer(&mut out), 9);
        assert!(stream.is_finished());

        // Packets after finish are ignored without error.
        assert!(stream.add_packet(RobotAudioPacket::new(32, &staircase(2))));
    }

    #[test]
    fn test_bytes_played_advances() {
        let stream = primed_stream(8);
        assert_eq!(stream.bytes_played(), 0);
        let mut out = [0i16; 10];
        stream.read_buffer(&mut out);
        assert_eq!(stream.bytes_played(), 20);
    }

    #[test]
    fn test_mid_stream_resume_origin() {
        // A resume submits packets at large positions; the first one
        // establishes the origin.
        let stream = RobotAudioStream::new(256);
        assert!(stream.add_packet(RobotAudioPacket::new(4096, &staircase(4))));
        assert!(stream.add_packet(RobotAudioPacket::new(4098, &staircase(4))));
        assert!(!stream.is_waiting());
        assert_eq!(stream.bytes_played(), 4096);

        let mut out = [0i16; 8];
        assert_eq!(stream.read_buffer(&mut out), 8);
        assert_eq!(stream.bytes_played(), 4096 + 16);
    }
}
