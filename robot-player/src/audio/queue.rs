//! Pending audio block queue
//!
//! Compressed audio blocks extracted from Robot frame records wait here
//! until the ring buffer has room. The queue is the back-pressure coupling
//! between decode rate and playback rate: submission stops at the first
//! refusal and resumes on a later call, and under overload the oldest block
//! is evicted in favor of the newest (a lossy but graceful degradation -
//! stale audio is worth less than fresh audio).

use std::collections::VecDeque;

use tracing::debug;

use super::stream::{RobotAudioPacket, RobotAudioStream};

/// Maximum number of blocks awaiting submission
pub const MAX_PENDING_BLOCKS: usize = 10;

/// Immutable snapshot of one compressed audio packet
#[derive(Debug, Clone)]
pub struct AudioBlock {
    /// Absolute expanded-stream byte position (always even)
    position: i64,
    /// Owned copy of the compressed bytes
    data: Vec<u8>,
}

impl AudioBlock {
    pub fn new(position: i64, data: Vec<u8>) -> Self {
        debug_assert!(position % 2 == 0);
        Self { position, data }
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Bounded FIFO of pending audio blocks
#[derive(Debug, Default)]
pub struct AudioBlockQueue {
    blocks: VecDeque<AudioBlock>,
}

impl AudioBlockQueue {
    pub fn new() -> Self {
        Self {
            blocks: VecDeque::with_capacity(MAX_PENDING_BLOCKS),
        }
    }

    /// Enqueue a block, evicting the oldest when full
    pub fn add_block(&mut self, block: AudioBlock) {
        if self.blocks.len() >= MAX_PENDING_BLOCKS {
            let evicted = self.blocks.pop_front();
            debug!(
                "audio block queue full; evicted block at {:?}",
                evicted.map(|b| b.position)
            );
        }
        self.blocks.push_back(block);
    }

    /// Submit as many queued blocks as the ring buffer will take
    ///
    /// Pops oldest-first, stopping at the first refusal or partial write;
    /// the refused block stays queued (resubmitting it whole is safe - the
    /// ring buffer clips away what was already applied). Returns the number
    /// of fully submitted blocks.
    pub fn submit_driver_max(&mut self, stream: &RobotAudioStream) -> usize {
        let mut submitted = 0;
        while let Some(block) = self.blocks.front() {
            let packet = RobotAudioPacket::new(block.position, &block.data);
            if !stream.add_packet(packet) {
                break;
            }
            self.blocks.pop_front();
            submitted += 1;
        }
        submitted
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(position: i64, len: usize) -> AudioBlock {
        AudioBlock::new(position, vec![0x01; len])
    }

    #[test]
    fn test_eviction_favors_newest() {
        let mut queue = AudioBlockQueue::new();
        for i in 0..=MAX_PENDING_BLOCKS as i64 {
            queue.add_block(block(i * 4, 2));
        }
        assert_eq!(queue.len(), MAX_PENDING_BLOCKS);
        // Block 0 was evicted; the front is now block 1.
        assert_eq!(queue.blocks.front().unwrap().position(), 4);
        assert_eq!(
            queue.blocks.back().unwrap().position(),
            MAX_PENDING_BLOCKS as i64 * 4
        );
    }

    #[test]
    fn test_submit_drains_in_order() {
        let stream = RobotAudioStream::new(1024);
        let mut queue = AudioBlockQueue::new();
        queue.add_block(block(0, 4));
        queue.add_block(block(2, 4));
        queue.add_block(block(16, 4));

        assert_eq!(queue.submit_driver_max(&stream), 3);
        assert!(queue.is_empty());
        assert!(!stream.is_waiting());
    }

    #[test]
    fn test_submit_stops_at_backpressure() {
        // Ring holds 16 samples; the third block cannot fully fit.
        let stream = RobotAudioStream::new(32);
        let mut queue = AudioBlockQueue::new();
        queue.add_block(block(0, 4));
        queue.add_block(block(2, 4));
        queue.add_block(block(16, 8));
        queue.add_block(block(32, 8));

        assert_eq!(queue.submit_driver_max(&stream), 2);
        assert_eq!(queue.len(), 2, "unsubmitted blocks stay queued");

        // Nothing read yet: a second attempt makes no progress.
        assert_eq!(queue.submit_driver_max(&stream), 0);
        assert_eq!(queue.len(), 2);

        // Drain half the ring, then submission resumes where it left off:
        // the third block completes, the fourth hits back-pressure.
        let mut out = [0i16; 8];
        assert_eq!(stream.read_buffer(&mut out), 8);
        assert_eq!(queue.submit_driver_max(&stream), 1);
        assert_eq!(queue.len(), 1);
    }
}
