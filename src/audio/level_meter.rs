//! Loudness metering and silence detection.
//!
//! The capture path writes instantaneous levels into atomics; a UI-rate
//! sampler reads them back, keeps a ring of recent values and derives the
//! dynamic silence threshold. Metering is advisory only; it never touches
//! segmentation or duration.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

/// Ring of recent sampled loudness values feeding the dynamic threshold.
pub const LEVEL_RING_CAPACITY: usize = 100;

/// How long the level must stay below threshold before silence fires.
pub const SILENCE_WINDOW: Duration = Duration::from_secs(5);

/// Floor for the dynamic threshold so dead-quiet rooms still register.
pub const MIN_SILENCE_THRESHOLD: f32 = 0.005;

/// Display-rate sampling cadence (~60 Hz).
pub const LEVEL_SAMPLE_INTERVAL: Duration = Duration::from_millis(16);

/// One loudness reading, both normalized to 0..1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelUpdate {
    pub rms: f32,
    pub peak: f32,
}

/// Lock-free level tap shared between the capture task and the sampler.
#[derive(Debug, Default)]
pub struct LevelMeter {
    rms_bits: AtomicU32,
    peak_bits: AtomicU32,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one batch of interleaved samples into the meter.
    pub fn ingest(&self, frames: &[f32]) {
        if frames.is_empty() {
            return;
        }
        let mut sum_squares = 0.0f32;
        let mut peak = 0.0f32;
        for &sample in frames {
            sum_squares += sample * sample;
            peak = peak.max(sample.abs());
        }
        let rms = (sum_squares / frames.len() as f32).sqrt().clamp(0.0, 1.0);
        self.rms_bits.store(rms.to_bits(), Ordering::Relaxed);
        self.peak_bits
            .store(peak.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn read(&self) -> LevelUpdate {
        LevelUpdate {
            rms: f32::from_bits(self.rms_bits.load(Ordering::Relaxed)),
            peak: f32::from_bits(self.peak_bits.load(Ordering::Relaxed)),
        }
    }

    pub fn reset(&self) {
        self.rms_bits.store(0, Ordering::Relaxed);
        self.peak_bits.store(0, Ordering::Relaxed);
    }
}

/// Tracks sampled levels and raises one silence signal per quiet stretch.
///
/// The threshold adapts to the room: `max(0.005, 0.1 * mean(ring))`.
pub struct SilenceDetector {
    ring: HeapRb<f32>,
    below_since: Option<Duration>,
    fired: bool,
}

impl SilenceDetector {
    pub fn new() -> Self {
        Self {
            ring: HeapRb::new(LEVEL_RING_CAPACITY),
            below_since: None,
            fired: false,
        }
    }

    fn threshold(&self) -> f32 {
        let occupied = self.ring.occupied_len();
        if occupied == 0 {
            return MIN_SILENCE_THRESHOLD;
        }
        let avg: f32 = self.ring.iter().copied().sum::<f32>() / occupied as f32;
        MIN_SILENCE_THRESHOLD.max(0.1 * avg)
    }

    /// Feed one sampled level at monotonic time `at`. Returns `true` exactly
    /// once per stretch of silence lasting [`SILENCE_WINDOW`].
    pub fn observe(&mut self, level: f32, at: Duration) -> bool {
        let threshold = self.threshold();
        self.ring.push_overwrite(level);

        if level >= threshold {
            self.below_since = None;
            self.fired = false;
            return false;
        }

        let since = *self.below_since.get_or_insert(at);
        if !self.fired && at.saturating_sub(since) >= SILENCE_WINDOW {
            self.fired = true;
            return true;
        }
        false
    }

    /// Forget any quiet stretch in progress (pause, state exit).
    pub fn reset(&mut self) {
        self.below_since = None;
        self.fired = false;
    }
}

impl Default for SilenceDetector {
    fn default() -> Self {
        Self::new()
    }
}
