//! RMS threshold classifier.

use super::{FrameClassifier, VadDecision};
use crate::buffering::frame::AudioFrame;

/// Marks a frame voiced when its RMS reaches `threshold`.
///
/// Stateless: debounce and hangover belong to the detector, so a single loud
/// click here only ever produces a one-frame `SpeechCandidate`.
#[derive(Debug, Clone)]
pub struct EnergyClassifier {
    /// Typical range: 0.01–0.05 for a quiet microphone.
    threshold: f32,
}

impl EnergyClassifier {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Default for EnergyClassifier {
    fn default() -> Self {
        Self::new(0.02)
    }
}

impl FrameClassifier for EnergyClassifier {
    fn classify(&mut self, frame: &AudioFrame) -> VadDecision {
        if !frame.is_empty() && frame.rms() >= self.threshold {
            VadDecision::Speech
        } else {
            VadDecision::Silence
        }
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(level: f32, len: usize) -> AudioFrame {
        AudioFrame::new(vec![level; len], 16_000, 1, 0)
    }

    #[test]
    fn silence_below_threshold() {
        let mut vad = EnergyClassifier::new(0.02);
        assert_eq!(vad.classify(&frame(0.0, 160)), VadDecision::Silence);
        assert_eq!(vad.classify(&frame(0.019, 160)), VadDecision::Silence);
    }

    #[test]
    fn speech_at_or_above_threshold() {
        let mut vad = EnergyClassifier::new(0.02);
        assert_eq!(vad.classify(&frame(0.5, 160)), VadDecision::Speech);
        assert_eq!(vad.classify(&frame(-0.3, 160)), VadDecision::Speech);
    }

    #[test]
    fn no_hangover_after_loud_frame() {
        let mut vad = EnergyClassifier::default();
        assert!(vad.classify(&frame(0.5, 160)).is_speech());
        assert!(!vad.classify(&frame(0.0, 160)).is_speech());
    }

    #[test]
    fn empty_frame_is_silence() {
        let mut vad = EnergyClassifier::new(0.0);
        assert_eq!(vad.classify(&frame(0.0, 0)), VadDecision::Silence);
    }
}
