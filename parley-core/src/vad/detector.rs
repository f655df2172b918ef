//! Debounce / hangover segmenter.
//!
//! ```text
//!            voiced                 N voiced in a row
//! Silence ──────────► SpeechCandidate ───────────────► Speaking
//!    ▲                     │ unvoiced (frames dropped)    │ ▲
//!    └─────────────────────┘                    unvoiced │ │ voiced (pause kept)
//!    ▲                                                   ▼ │
//!    └──────────── hangover elapsed (emit) ────── TrailingSilence
//! ```
//!
//! Segment duration is kept within `[min_speech_ms, max_segment_ms]`:
//! continuous speech is flushed before a frame would push it past the
//! maximum, and episodes shorter than the minimum are dropped.

use tracing::{debug, trace};

use super::{FrameClassifier, VadDecision};
use crate::buffering::frame::AudioFrame;
use crate::buffering::segment::{SegmentBuffer, SpeechSegment};
use crate::config::PipelineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Silence,
    SpeechCandidate,
    Speaking,
    TrailingSilence,
}

/// Thresholds for the segmenter, derived from `PipelineConfig`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadSettings {
    pub debounce_frames: u32,
    pub hangover_frames: u32,
    pub min_speech_ms: f64,
    pub max_segment_ms: f64,
}

impl VadSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            debounce_frames: config.speech_debounce_frames.max(1),
            hangover_frames: config.hangover_frames(),
            min_speech_ms: config.min_speech_ms as f64,
            max_segment_ms: config.max_segment_ms as f64,
        }
    }
}

pub struct VoiceActivityDetector {
    classifier: Box<dyn FrameClassifier>,
    settings: VadSettings,
    state: VadState,
    buffer: SegmentBuffer,
    voiced_run: u32,
    silent_run: u32,
    next_segment_id: u64,
    rejected_candidates: u64,
    discarded_short: u64,
}

impl VoiceActivityDetector {
    pub fn new(classifier: Box<dyn FrameClassifier>, settings: VadSettings) -> Self {
        Self {
            classifier,
            settings,
            state: VadState::Silence,
            buffer: SegmentBuffer::new(),
            voiced_run: 0,
            silent_run: 0,
            next_segment_id: 0,
            rejected_candidates: 0,
            discarded_short: 0,
        }
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    /// Candidates dropped before the debounce threshold.
    pub fn rejected_candidates(&self) -> u64 {
        self.rejected_candidates
    }

    /// Closed episodes dropped for being shorter than `min_speech_ms`.
    pub fn discarded_short(&self) -> u64 {
        self.discarded_short
    }

    /// Classify one frame and advance the state machine.
    ///
    /// Returns the segments completed by this frame: usually none, one when
    /// an episode closes or a forced flush fires.
    pub fn process(&mut self, frame: AudioFrame) -> Vec<SpeechSegment> {
        let decision = self.classifier.classify(&frame);
        self.step(frame, decision)
    }

    /// Advance the state machine with an externally supplied decision.
    pub fn step(&mut self, frame: AudioFrame, decision: VadDecision) -> Vec<SpeechSegment> {
        let mut out = Vec::new();
        let voiced = decision.is_speech();

        match self.state {
            VadState::Silence => {
                if voiced {
                    self.buffer.push(frame);
                    self.voiced_run = 1;
                    self.state = VadState::SpeechCandidate;
                    self.confirm_if_debounced();
                }
            }
            VadState::SpeechCandidate => {
                if voiced {
                    self.buffer.push(frame);
                    self.voiced_run += 1;
                    self.confirm_if_debounced();
                } else {
                    trace!(
                        voiced_run = self.voiced_run,
                        "VAD: SpeechCandidate -> Silence (rejected)"
                    );
                    self.buffer.clear();
                    self.voiced_run = 0;
                    self.rejected_candidates += 1;
                    self.state = VadState::Silence;
                }
            }
            VadState::Speaking => {
                if voiced {
                    self.commit(frame, &mut out);
                } else {
                    self.buffer.hold(frame);
                    self.silent_run = 1;
                    self.state = VadState::TrailingSilence;
                    self.close_if_hangover_elapsed(&mut out);
                }
            }
            VadState::TrailingSilence => {
                if voiced {
                    trace!(
                        silent_run = self.silent_run,
                        "VAD: TrailingSilence -> Speaking (pause kept)"
                    );
                    for held in self.buffer.take_held() {
                        self.commit(held, &mut out);
                    }
                    self.commit(frame, &mut out);
                    self.silent_run = 0;
                    self.state = VadState::Speaking;
                } else {
                    self.buffer.hold(frame);
                    self.silent_run += 1;
                    self.close_if_hangover_elapsed(&mut out);
                }
            }
        }

        out
    }

    /// Emit whatever confirmed speech is buffered (used on shutdown).
    pub fn flush(&mut self) -> Option<SpeechSegment> {
        let segment = match self.state {
            VadState::Speaking | VadState::TrailingSilence => self.finish(false),
            VadState::Silence | VadState::SpeechCandidate => None,
        };
        self.reset();
        segment
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.classifier.reset();
        self.voiced_run = 0;
        self.silent_run = 0;
        self.state = VadState::Silence;
    }

    fn confirm_if_debounced(&mut self) {
        if self.voiced_run >= self.settings.debounce_frames {
            debug!(
                frames = self.voiced_run,
                "VAD: SpeechCandidate -> Speaking (speech confirmed)"
            );
            self.state = VadState::Speaking;
            self.voiced_run = 0;
        }
    }

    fn close_if_hangover_elapsed(&mut self, out: &mut Vec<SpeechSegment>) {
        if self.silent_run >= self.settings.hangover_frames {
            self.silent_run = 0;
            self.state = VadState::Silence;
            if let Some(segment) = self.finish(false) {
                out.push(segment);
            }
        }
    }

    /// Append a frame to the open segment, flushing first if the frame would
    /// push it past `max_segment_ms`.
    fn commit(&mut self, frame: AudioFrame, out: &mut Vec<SpeechSegment>) {
        let projected = self.buffer.duration_ms() + frame.duration_ms();
        if !self.buffer.is_empty() && projected > self.settings.max_segment_ms {
            debug!(
                duration_ms = self.buffer.duration_ms(),
                "VAD: max segment length reached, forcing flush"
            );
            // Keep held frames: they belong to the segment that continues.
            let held = self.buffer.take_held();
            if let Some(segment) = self.finish(true) {
                out.push(segment);
            }
            for f in held {
                self.buffer.hold(f);
            }
        }
        self.buffer.push(frame);
    }

    fn finish(&mut self, forced: bool) -> Option<SpeechSegment> {
        let duration_ms = self.buffer.duration_ms();
        if duration_ms + f64::EPSILON < self.settings.min_speech_ms {
            debug!(duration_ms, "VAD: episode shorter than min_speech_ms, dropped");
            self.buffer.clear();
            self.discarded_short += 1;
            return None;
        }
        let id = self.next_segment_id;
        let segment = self.buffer.finish(id, forced)?;
        self.next_segment_id += 1;
        debug!(
            segment_id = id,
            duration_ms,
            frames = segment.frame_count(),
            forced,
            "VAD: segment emitted"
        );
        Some(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::vad::EnergyClassifier;

    const FRAME: usize = 160; // 10 ms at 16 kHz

    fn settings(debounce: u32, hangover: u32) -> VadSettings {
        VadSettings {
            debounce_frames: debounce,
            hangover_frames: hangover,
            min_speech_ms: 10.0,
            max_segment_ms: 10_000.0,
        }
    }

    fn detector(settings: VadSettings) -> VoiceActivityDetector {
        VoiceActivityDetector::new(Box::new(EnergyClassifier::new(0.05)), settings)
    }

    /// `true` = loud frame, `false` = silent frame.
    fn run(vad: &mut VoiceActivityDetector, pattern: &[bool]) -> Vec<SpeechSegment> {
        let mut segments = Vec::new();
        for (seq, voiced) in pattern.iter().enumerate() {
            let level = if *voiced { 0.3 } else { 0.0 };
            let frame = AudioFrame::new(vec![level; FRAME], 16_000, 1, seq as u64);
            segments.extend(vad.process(frame));
        }
        segments
    }

    fn pattern(parts: &[(bool, usize)]) -> Vec<bool> {
        parts
            .iter()
            .flat_map(|(v, n)| std::iter::repeat(*v).take(*n))
            .collect()
    }

    #[test]
    fn short_voiced_runs_never_emit() {
        for debounce in 2..8u32 {
            for run_len in 1..debounce as usize {
                let mut vad = detector(settings(debounce, 3));
                let segs = run(&mut vad, &pattern(&[(false, 2), (true, run_len), (false, 20)]));
                assert!(
                    segs.is_empty(),
                    "debounce={debounce} run={run_len} emitted {}",
                    segs.len()
                );
                assert_eq!(vad.rejected_candidates(), 1);
                assert_eq!(vad.state(), VadState::Silence);
            }
        }
    }

    #[test]
    fn confirmed_run_emits_exactly_one_segment_spanning_it() {
        for debounce in 1..6u32 {
            for run_len in debounce as usize..debounce as usize + 12 {
                let hangover = 4;
                let mut vad = detector(settings(debounce, hangover));
                let segs = run(
                    &mut vad,
                    &pattern(&[(false, 3), (true, run_len), (false, hangover as usize + 2)]),
                );
                assert_eq!(segs.len(), 1, "debounce={debounce} run={run_len}");
                let seg = &segs[0];
                assert_eq!(seg.frame_count(), run_len);
                assert_eq!(seg.seq_range(), (3, 3 + run_len as u64 - 1));
                assert!(!seg.forced);
            }
        }
    }

    #[test]
    fn pause_shorter_than_hangover_is_kept_inside_segment() {
        let mut vad = detector(settings(2, 5));
        let segs = run(
            &mut vad,
            &pattern(&[(true, 4), (false, 3), (true, 4), (false, 6)]),
        );
        assert_eq!(segs.len(), 1);
        // 4 voiced + 3 pause + 4 voiced; trailing silence excluded
        assert_eq!(segs[0].frame_count(), 11);
        assert_eq!(segs[0].seq_range(), (0, 10));
    }

    #[test]
    fn pause_reaching_hangover_splits_episodes() {
        let mut vad = detector(settings(2, 3));
        let segs = run(
            &mut vad,
            &pattern(&[(true, 4), (false, 3), (true, 4), (false, 3)]),
        );
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].seq_range(), (0, 3));
        assert_eq!(segs[1].seq_range(), (7, 10));
        assert_eq!(segs[1].id, segs[0].id + 1);
    }

    #[test]
    fn continuous_speech_is_force_flushed_at_max_length() {
        let mut vad = detector(VadSettings {
            debounce_frames: 2,
            hangover_frames: 3,
            min_speech_ms: 10.0,
            max_segment_ms: 100.0,
        });
        let segs = run(&mut vad, &pattern(&[(true, 25)]));
        assert_eq!(segs.len(), 2);
        for seg in &segs {
            assert!(seg.forced);
            assert!(seg.duration_ms() <= 100.0 + 1e-9);
            assert_eq!(seg.frame_count(), 10);
        }
        assert_eq!(vad.state(), VadState::Speaking);

        let tail = vad.flush().expect("tail segment");
        assert_eq!(tail.frame_count(), 5);
        assert!(!tail.forced);
    }

    #[test]
    fn episodes_shorter_than_min_speech_are_dropped() {
        let mut vad = detector(VadSettings {
            debounce_frames: 2,
            hangover_frames: 2,
            min_speech_ms: 50.0,
            max_segment_ms: 1_000.0,
        });
        let segs = run(&mut vad, &pattern(&[(true, 3), (false, 4)]));
        assert!(segs.is_empty());
        assert_eq!(vad.discarded_short(), 1);

        let segs = run(&mut vad, &pattern(&[(true, 5), (false, 4)]));
        assert_eq!(segs.len(), 1);
    }

    #[test]
    fn flush_ignores_unconfirmed_candidate() {
        let mut vad = detector(settings(5, 3));
        run(&mut vad, &pattern(&[(true, 3)]));
        assert_eq!(vad.state(), VadState::SpeechCandidate);
        assert!(vad.flush().is_none());
        assert_eq!(vad.state(), VadState::Silence);
    }

    #[test]
    fn single_frame_hangover_closes_on_first_silence() {
        let mut vad = detector(settings(1, 1));
        let segs = run(&mut vad, &pattern(&[(true, 3), (false, 1)]));
        assert_eq!(segs.len(), 1);
        assert_eq!(vad.state(), VadState::Silence);
    }
}
