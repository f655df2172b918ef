//! Immutable audio frame passed from capture to the VAD.

use std::sync::Arc;
use std::time::Instant;

/// A fixed-length block of interleaved PCM samples.
///
/// Samples live behind an `Arc<[f32]>`: once captured a frame is only ever
/// referenced, never mutated, and cloning it (into a segment, a recording, a
/// diagnostics tap) is a refcount bump.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    pub channels: u16,
    /// Monotonic capture sequence number, starting at 0 per pipeline run.
    pub seq: u64,
    pub captured_at: Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16, seq: u64) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            channels: channels.max(1),
            seq,
            captured_at: Instant::now(),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Frames per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Duration of this frame in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        self.frames() as f64 * 1000.0 / self.sample_rate as f64
    }

    /// Root-mean-square level over all channels.
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Root-mean-square of a sample slice; `0.0` for an empty slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
