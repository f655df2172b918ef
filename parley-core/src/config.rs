//! Pipeline configuration.
//!
//! One `PipelineConfig` value is built (defaults → JSON file → env overrides →
//! `normalize()`) before the engine starts and is then shared read-only by
//! every component. Nothing reads configuration from the environment after
//! start-up.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How the agent decides whether an utterance deserves a spoken response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseMode {
    /// Respond to every valid utterance.
    Always,
    /// Respond when addressed by name, asked a question, or greeted.
    AddressCue,
}

/// Bounded exponential backoff for remote port calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Random spread applied to each backoff, as a fraction of the delay.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 4_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// Voice selection forwarded to the synthesis port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct VoiceSettings {
    pub voice: String,
    pub speed: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            voice: "alloy".into(),
            speed: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct PipelineConfig {
    /// Pipeline sample rate (Hz). Devices at other rates are resampled.
    pub sample_rate: u32,
    pub channels: u16,
    /// Frame length in milliseconds; every `AudioFrame` covers exactly this.
    pub frame_ms: u32,

    /// RMS level above which the energy classifier marks a frame voiced.
    pub vad_threshold: f32,
    /// Consecutive voiced frames required to confirm speech.
    pub speech_debounce_frames: u32,
    /// Trailing silence required before a segment is closed.
    pub hangover_ms: u32,
    /// Segments shorter than this are dropped.
    pub min_speech_ms: u32,
    /// Continuous speech is force-flushed at this length.
    pub max_segment_ms: u32,

    pub frame_queue_capacity: usize,
    pub segment_queue_capacity: usize,
    pub source_read_timeout_ms: u64,

    /// Transcripts below this confidence are discarded.
    pub min_transcript_confidence: f32,

    pub agent_name: String,
    /// Pinned system preamble. `None` builds one from `agent_name`.
    pub preamble: Option<String>,
    pub response_mode: ResponseMode,
    /// Maximum turns kept in history, pinned preamble included.
    pub history_cap: usize,
    pub context_max_turns: usize,
    pub context_max_chars: usize,

    pub transcription_timeout_ms: u64,
    pub generation_timeout_ms: u64,
    pub synthesis_timeout_ms: u64,
    pub retry: RetryConfig,
    /// How long the orchestrator waits for a cancelled call to wind down.
    pub cancel_ack_timeout_ms: u64,

    pub voice: VoiceSettings,
    /// Responses longer than this are synthesized in sentence chunks.
    pub synthesis_max_chars: usize,

    /// Pause after the agent finishes speaking before listening again.
    pub cooldown_ms: u64,
    /// Segments arriving this soon after playback starts are treated as echo.
    /// `0` disables echo suppression.
    pub barge_in_grace_ms: u64,

    pub playback_ring_samples: usize,
    pub playback_chunk_samples: usize,

    /// Keep the meeting microphone muted except while speaking.
    pub mute_when_idle: bool,
    pub mirror_responses_to_chat: bool,

    /// JSON-lines log of finalized turns.
    pub conversation_log_path: Option<PathBuf>,
    /// Directory for WAV copies of detected segments.
    pub recordings_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            frame_ms: 30,
            vad_threshold: 0.02,
            speech_debounce_frames: 5,
            hangover_ms: 900,
            min_speech_ms: 300,
            max_segment_ms: 15_000,
            frame_queue_capacity: 256,
            segment_queue_capacity: 8,
            source_read_timeout_ms: 200,
            min_transcript_confidence: 0.4,
            agent_name: "AI Assistant".into(),
            preamble: None,
            response_mode: ResponseMode::Always,
            history_cap: 50,
            context_max_turns: 20,
            context_max_chars: 6_000,
            transcription_timeout_ms: 15_000,
            generation_timeout_ms: 30_000,
            synthesis_timeout_ms: 20_000,
            retry: RetryConfig::default(),
            cancel_ack_timeout_ms: 250,
            voice: VoiceSettings::default(),
            synthesis_max_chars: 4_000,
            cooldown_ms: 500,
            barge_in_grace_ms: 300,
            playback_ring_samples: 16_384,
            playback_chunk_samples: 480,
            mute_when_idle: true,
            mirror_responses_to_chat: false,
            conversation_log_path: None,
            recordings_dir: None,
        }
    }
}

impl PipelineConfig {
    /// Clamp every field into a workable range.
    pub fn normalize(&mut self) {
        self.sample_rate = self.sample_rate.clamp(8_000, 48_000);
        self.channels = self.channels.clamp(1, 8);
        self.frame_ms = self.frame_ms.clamp(10, 100);
        self.vad_threshold = self.vad_threshold.clamp(0.0005, 0.5);
        self.speech_debounce_frames = self.speech_debounce_frames.clamp(1, 100);
        self.hangover_ms = self.hangover_ms.clamp(self.frame_ms, 10_000);
        self.min_speech_ms = self.min_speech_ms.clamp(self.frame_ms, 10_000);
        self.max_segment_ms = self
            .max_segment_ms
            .clamp(self.min_speech_ms.max(1_000), 120_000);
        // A held trailing-silence run must fit inside one forced flush.
        self.hangover_ms = self.hangover_ms.min(self.max_segment_ms / 2);
        self.frame_queue_capacity = self.frame_queue_capacity.clamp(8, 16_384);
        self.segment_queue_capacity = self.segment_queue_capacity.clamp(1, 256);
        self.source_read_timeout_ms = self.source_read_timeout_ms.clamp(10, 5_000);
        self.min_transcript_confidence = self.min_transcript_confidence.clamp(0.0, 1.0);

        self.agent_name = self.agent_name.trim().to_string();
        if self.agent_name.is_empty() {
            self.agent_name = "AI Assistant".into();
        }
        self.preamble = self
            .preamble
            .as_ref()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        self.history_cap = self.history_cap.clamp(2, 10_000);
        self.context_max_turns = self.context_max_turns.clamp(1, self.history_cap);
        self.context_max_chars = self.context_max_chars.clamp(64, 1_000_000);

        self.transcription_timeout_ms = self.transcription_timeout_ms.clamp(50, 300_000);
        self.generation_timeout_ms = self.generation_timeout_ms.clamp(50, 300_000);
        self.synthesis_timeout_ms = self.synthesis_timeout_ms.clamp(50, 300_000);
        self.retry.max_attempts = self.retry.max_attempts.clamp(1, 10);
        self.retry.initial_backoff_ms = self.retry.initial_backoff_ms.min(60_000);
        self.retry.max_backoff_ms = self
            .retry
            .max_backoff_ms
            .clamp(self.retry.initial_backoff_ms, 120_000);
        self.retry.multiplier = self.retry.multiplier.clamp(1.0, 10.0);
        self.retry.jitter = self.retry.jitter.clamp(0.0, 1.0);
        self.cancel_ack_timeout_ms = self.cancel_ack_timeout_ms.clamp(10, 10_000);

        self.voice.voice = self.voice.voice.trim().to_string();
        if self.voice.voice.is_empty() {
            self.voice.voice = VoiceSettings::default().voice;
        }
        self.voice.speed = self.voice.speed.clamp(0.25, 4.0);
        self.synthesis_max_chars = self.synthesis_max_chars.clamp(32, 100_000);

        self.cooldown_ms = self.cooldown_ms.min(10_000);
        self.barge_in_grace_ms = self.barge_in_grace_ms.min(5_000);
        self.playback_chunk_samples = self.playback_chunk_samples.clamp(16, 16_384);
        self.playback_ring_samples = self
            .playback_ring_samples
            .clamp(self.playback_chunk_samples * 2, 1 << 20);
    }

    /// Apply `PARLEY_*` environment overrides for operational knobs.
    pub fn apply_env_overrides(&mut self) {
        if let Some(path) = std::env::var_os("PARLEY_CONVERSATION_LOG") {
            self.conversation_log_path = Some(PathBuf::from(path));
        }
        if let Some(path) = std::env::var_os("PARLEY_RECORDINGS_DIR") {
            self.recordings_dir = Some(PathBuf::from(path));
        }
        if let Some(ms) = std::env::var("PARLEY_COOLDOWN_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.cooldown_ms = ms;
        }
        if let Some(ms) = std::env::var("PARLEY_BARGE_IN_GRACE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.barge_in_grace_ms = ms;
        }
    }

    /// Interleaved samples per frame.
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize / 1000) * self.channels as usize
    }

    /// Frames of trailing silence that close a segment.
    pub fn hangover_frames(&self) -> u32 {
        self.hangover_ms.div_ceil(self.frame_ms).max(1)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn barge_in_grace(&self) -> Duration {
        Duration::from_millis(self.barge_in_grace_ms)
    }

    pub fn cancel_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_ack_timeout_ms)
    }

    pub fn source_read_timeout(&self) -> Duration {
        Duration::from_millis(self.source_read_timeout_ms)
    }

    /// The pinned system preamble.
    pub fn effective_preamble(&self) -> String {
        self.preamble.clone().unwrap_or_else(|| {
            format!(
                "You are {}, a voice participant in a live meeting. Keep replies short and conversational.",
                self.agent_name
            )
        })
    }
}

/// Load a config file, falling back to defaults when it is missing.
///
/// A file that exists but does not parse is an error rather than a silent
/// reset to defaults.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let mut config = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<PipelineConfig>(&raw)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => PipelineConfig::default(),
        Err(e) => return Err(e.into()),
    };
    config.apply_env_overrides();
    config.normalize();
    Ok(config)
}

pub fn save_config(path: &Path, config: &PipelineConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_normalize_unchanged() {
        let mut config = PipelineConfig::default();
        let before = config.clone();
        config.normalize();
        assert_eq!(config, before);
    }

    #[test]
    fn derived_frame_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.frame_samples(), 480);
        // 900 ms / 30 ms
        assert_eq!(config.hangover_frames(), 30);

        let config = PipelineConfig {
            hangover_ms: 100,
            frame_ms: 30,
            ..PipelineConfig::default()
        };
        assert_eq!(config.hangover_frames(), 4);
    }

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let mut config = PipelineConfig {
            frame_ms: 1,
            speech_debounce_frames: 0,
            history_cap: 0,
            min_transcript_confidence: 3.0,
            agent_name: "   ".into(),
            preamble: Some("  ".into()),
            ..PipelineConfig::default()
        };
        config.retry.max_attempts = 0;
        config.normalize();

        assert_eq!(config.frame_ms, 10);
        assert_eq!(config.speech_debounce_frames, 1);
        assert_eq!(config.history_cap, 2);
        assert_eq!(config.min_transcript_confidence, 1.0);
        assert_eq!(config.agent_name, "AI Assistant");
        assert!(config.preamble.is_none());
        assert_eq!(config.retry.max_attempts, 1);
        assert!(config.max_segment_ms >= config.min_speech_ms);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let raw = r#"{ "agentName": "Juno", "responseMode": "addressCue", "retry": { "maxAttempts": 5 } }"#;
        let config: PipelineConfig = serde_json::from_str(raw).expect("parse partial config");
        assert_eq!(config.agent_name, "Juno");
        assert_eq!(config.response_mode, ResponseMode::AddressCue);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff_ms, 250);
        assert_eq!(config.sample_rate, 16_000);
    }

    #[test]
    fn save_then_load_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("parley.json");
        let config = PipelineConfig {
            agent_name: "Juno".into(),
            cooldown_ms: 750,
            ..PipelineConfig::default()
        };
        save_config(&path, &config).expect("save config");
        let loaded = load_config(&path).expect("load config");
        assert_eq!(loaded.agent_name, "Juno");
        assert_eq!(loaded.frame_ms, config.frame_ms);
    }

    #[test]
    fn missing_file_loads_defaults_but_garbage_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("absent.json");
        assert!(load_config(&missing).is_ok());

        let garbage = dir.path().join("garbage.json");
        fs::write(&garbage, "{ not json").expect("write garbage");
        assert!(load_config(&garbage).is_err());
    }
}
