//! Voice activity detection.
//!
//! Two layers:
//! - `FrameClassifier` scores one frame as voiced or not. `EnergyClassifier`
//!   is the default; a neural classifier can be swapped in without touching
//!   the segmenter.
//! - `VoiceActivityDetector` runs the debounce / hangover state machine over
//!   classifier decisions and assembles `SpeechSegment`s.

pub mod detector;
pub mod energy;

pub use detector::{VadSettings, VadState, VoiceActivityDetector};
pub use energy::EnergyClassifier;

use crate::buffering::frame::AudioFrame;

/// Whether a given audio frame contains speech or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    Speech,
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

/// Per-frame voice classifier injected into the detector.
///
/// Implementors may be stateful (noise floors, RNN hidden states, etc.).
pub trait FrameClassifier: Send + 'static {
    fn classify(&mut self, frame: &AudioFrame) -> VadDecision;

    /// Reset any internal state between pipeline runs.
    fn reset(&mut self);
}
