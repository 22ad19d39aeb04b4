//! Frame render-time prediction
//!
//! The scheduler decides which frame to show next based on how long the
//! *next* frame will probably take to render. The estimate is the median of
//! the last ten per-frame render durations: the median shrugs off the
//! occasional slow frame (OS scheduling hiccups, one expensive cel) that
//! would drag a mean and destabilize the frame-advance decision.

/// Number of samples in the sliding window
pub const DELAY_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy)]
struct DelaySample {
    /// Monotonically increasing insertion id; the smallest id marks the
    /// slot that the next sample replaces
    id: u32,
    /// Render duration in ticks
    ticks: u32,
}

/// Sliding-window median estimator of per-frame render time
#[derive(Debug)]
pub struct FrameRateTimer {
    /// Window kept sorted ascending by `ticks` after every insertion
    samples: [DelaySample; DELAY_WINDOW],
    next_id: u32,
    start_tick: Option<u32>,
}

impl FrameRateTimer {
    pub fn new() -> Self {
        let mut samples = [DelaySample { id: 0, ticks: 0 }; DELAY_WINDOW];
        for (i, sample) in samples.iter_mut().enumerate() {
            sample.id = i as u32;
        }
        Self {
            samples,
            next_id: DELAY_WINDOW as u32,
            start_tick: None,
        }
    }

    /// Mark the start of one frame's render work
    pub fn start_timing(&mut self, now_tick: u32) {
        self.start_tick = Some(now_tick);
    }

    /// Mark the end of one frame's render work and fold the elapsed time
    /// into the window
    pub fn end_timing(&mut self, now_tick: u32) {
        let Some(start) = self.start_tick.take() else {
            return;
        };
        let elapsed = now_tick.saturating_sub(start);

        // Replace the single oldest sample, tag it with a fresh id, then
        // re-sort the whole window.
        let oldest = self
            .samples
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.id)
            .map(|(i, _)| i)
            .unwrap();
        self.samples[oldest] = DelaySample {
            id: self.next_id,
            ticks: elapsed,
        };
        self.next_id += 1;
        self.samples.sort_by_key(|s| s.ticks);
    }

    /// Predicted render time for the next frame, in ticks
    pub fn predicted_ticks(&self) -> u32 {
        self.samples[DELAY_WINDOW / 2].ticks
    }
}

impl Default for FrameRateTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(timer: &mut FrameRateTimer, base: u32, elapsed: u32) {
        timer.start_timing(base);
        timer.end_timing(base + elapsed);
    }

    #[test]
    fn test_median_of_known_sequence() {
        let mut timer = FrameRateTimer::new();
        let mut now = 0;
        for elapsed in [5, 1, 9, 3, 7, 2, 8, 4, 6, 0] {
            insert(&mut timer, now, elapsed);
            now += 100;
        }
        // Sorted window is [0..=9]; the middle slot (index 5) holds 5.
        assert_eq!(timer.predicted_ticks(), 5);
    }

    #[test]
    fn test_outlier_resistance() {
        let mut timer = FrameRateTimer::new();
        let mut now = 0;
        for _ in 0..9 {
            insert(&mut timer, now, 2);
            now += 100;
        }
        // One pathological frame must not move the prediction.
        insert(&mut timer, now, 600);
        assert_eq!(timer.predicted_ticks(), 2);
    }

    #[test]
    fn test_oldest_sample_evicted() {
        let mut timer = FrameRateTimer::new();
        let mut now = 0;
        // Fill the window with large values, then push 10 small ones; the
        // large values must all be gone.
        for _ in 0..DELAY_WINDOW {
            insert(&mut timer, now, 50);
            now += 100;
        }
        for _ in 0..DELAY_WINDOW {
            insert(&mut timer, now, 1);
            now += 100;
        }
        assert_eq!(timer.predicted_ticks(), 1);
    }

    #[test]
    fn test_end_without_start_is_ignored() {
        let mut timer = FrameRateTimer::new();
        timer.end_timing(1000);
        assert_eq!(timer.predicted_ticks(), 0);
    }

    #[test]
    fn test_initial_prediction_is_zero() {
        assert_eq!(FrameRateTimer::new().predicted_ticks(), 0);
    }
}
