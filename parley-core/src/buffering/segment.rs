//! Speech segments and the in-flight accumulator the VAD builds them with.

use std::time::{Duration, Instant};

use super::frame::AudioFrame;

/// One contiguous speech episode, bounded by a confirmed VAD start and end.
///
/// Built only by the VAD and handed to the orchestrator by value, so each
/// segment is consumed exactly once.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    /// Monotonic segment id within one pipeline run.
    pub id: u64,
    frames: Vec<AudioFrame>,
    pub sample_rate: u32,
    pub channels: u16,
    pub started_at: Instant,
    pub ended_at: Instant,
    /// Mean per-frame RMS.
    pub average_energy: f32,
    /// `true` when closed by the max-length flush rather than by silence.
    pub forced: bool,
}

impl SpeechSegment {
    pub fn frames(&self) -> &[AudioFrame] {
        &self.frames
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn duration_ms(&self) -> f64 {
        self.frames.iter().map(AudioFrame::duration_ms).sum()
    }

    /// Capture sequence numbers of the first and last frame.
    pub fn seq_range(&self) -> (u64, u64) {
        let first = self.frames.first().map(|f| f.seq).unwrap_or(0);
        let last = self.frames.last().map(|f| f.seq).unwrap_or(first);
        (first, last)
    }

    /// All samples, concatenated in capture order.
    pub fn samples(&self) -> Vec<f32> {
        let total = self.frames.iter().map(|f| f.samples().len()).sum();
        let mut out = Vec::with_capacity(total);
        for frame in &self.frames {
            out.extend_from_slice(frame.samples());
        }
        out
    }
}

/// Accumulates frames for the segment currently being detected.
///
/// Frames are either *committed* (voiced, or a pause the speaker resumed
/// after) or *held* (trailing silence that may still turn out to be the end
/// of the episode). Held frames never reach a segment unless committed.
#[derive(Debug, Default)]
pub struct SegmentBuffer {
    frames: Vec<AudioFrame>,
    held: Vec<AudioFrame>,
    energy_sum: f64,
    duration_ms: f64,
}

impl SegmentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: AudioFrame) {
        self.energy_sum += frame.rms() as f64;
        self.duration_ms += frame.duration_ms();
        self.frames.push(frame);
    }

    /// Hold a trailing-silence frame pending the hangover decision.
    pub fn hold(&mut self, frame: AudioFrame) {
        self.held.push(frame);
    }

    /// Move held frames out, in order, so the caller can commit them one by one.
    pub fn take_held(&mut self) -> Vec<AudioFrame> {
        std::mem::take(&mut self.held)
    }

    /// Duration of committed frames.
    pub fn duration_ms(&self) -> f64 {
        self.duration_ms
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.held.clear();
        self.energy_sum = 0.0;
        self.duration_ms = 0.0;
    }

    /// Close the committed frames into a segment and reset. Held frames are
    /// discarded. Returns `None` when nothing was committed.
    pub fn finish(&mut self, id: u64, forced: bool) -> Option<SpeechSegment> {
        self.held.clear();
        if self.frames.is_empty() {
            self.clear();
            return None;
        }
        let frames = std::mem::take(&mut self.frames);
        let average_energy = (self.energy_sum / frames.len() as f64) as f32;
        self.clear();

        let first = &frames[0];
        let last = &frames[frames.len() - 1];
        let ended_at =
            last.captured_at + Duration::from_secs_f64(last.duration_ms() / 1000.0);
        Some(SpeechSegment {
            id,
            sample_rate: first.sample_rate,
            channels: first.channels,
            started_at: first.captured_at,
            ended_at,
            average_energy,
            forced,
            frames,
        })
    }
}
