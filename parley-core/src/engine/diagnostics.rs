//! Lock-free pipeline counters, shared by the capture, VAD and playback
//! threads and the orchestrator task.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct PipelineDiagnostics {
    pub frames_captured: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub frames_classified: AtomicU64,
    pub candidates_rejected: AtomicU64,
    pub short_segments_discarded: AtomicU64,
    pub segments_emitted: AtomicU64,
    pub segments_forced: AtomicU64,
    pub utterances_discarded: AtomicU64,
    pub human_turns: AtomicU64,
    pub agent_turns: AtomicU64,
    pub port_calls: AtomicU64,
    pub port_failures: AtomicU64,
    pub barge_ins: AtomicU64,
    pub echo_suppressed: AtomicU64,
    pub samples_played: AtomicU64,
    pub playback_flushes: AtomicU64,
    pub playback_underruns: AtomicU64,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.frames_captured.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.frames_classified.store(0, Ordering::Relaxed);
        self.candidates_rejected.store(0, Ordering::Relaxed);
        self.short_segments_discarded.store(0, Ordering::Relaxed);
        self.segments_emitted.store(0, Ordering::Relaxed);
        self.segments_forced.store(0, Ordering::Relaxed);
        self.utterances_discarded.store(0, Ordering::Relaxed);
        self.human_turns.store(0, Ordering::Relaxed);
        self.agent_turns.store(0, Ordering::Relaxed);
        self.port_calls.store(0, Ordering::Relaxed);
        self.port_failures.store(0, Ordering::Relaxed);
        self.barge_ins.store(0, Ordering::Relaxed);
        self.echo_suppressed.store(0, Ordering::Relaxed);
        self.samples_played.store(0, Ordering::Relaxed);
        self.playback_flushes.store(0, Ordering::Relaxed);
        self.playback_underruns.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_classified: self.frames_classified.load(Ordering::Relaxed),
            candidates_rejected: self.candidates_rejected.load(Ordering::Relaxed),
            short_segments_discarded: self.short_segments_discarded.load(Ordering::Relaxed),
            segments_emitted: self.segments_emitted.load(Ordering::Relaxed),
            segments_forced: self.segments_forced.load(Ordering::Relaxed),
            utterances_discarded: self.utterances_discarded.load(Ordering::Relaxed),
            human_turns: self.human_turns.load(Ordering::Relaxed),
            agent_turns: self.agent_turns.load(Ordering::Relaxed),
            port_calls: self.port_calls.load(Ordering::Relaxed),
            port_failures: self.port_failures.load(Ordering::Relaxed),
            barge_ins: self.barge_ins.load(Ordering::Relaxed),
            echo_suppressed: self.echo_suppressed.load(Ordering::Relaxed),
            samples_played: self.samples_played.load(Ordering::Relaxed),
            playback_flushes: self.playback_flushes.load(Ordering::Relaxed),
            playback_underruns: self.playback_underruns.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub frames_classified: u64,
    pub candidates_rejected: u64,
    pub short_segments_discarded: u64,
    pub segments_emitted: u64,
    pub segments_forced: u64,
    pub utterances_discarded: u64,
    pub human_turns: u64,
    pub agent_turns: u64,
    pub port_calls: u64,
    pub port_failures: u64,
    pub barge_ins: u64,
    pub echo_suppressed: u64,
    pub samples_played: u64,
    pub playback_flushes: u64,
    pub playback_underruns: u64,
}
