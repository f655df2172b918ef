//! Offline port implementations.
//!
//! Used by the `parley-sim` binary and for exercising the full pipeline
//! without network access. They are deterministic and honour cancellation.

use std::f32::consts::TAU;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    GenerationPort, GenerationRequest, PortError, PortResult, SynthesisPort, SynthesisRequest,
    SynthesizedAudio, Transcript, TranscriptionPort, TranscriptionRequest,
};
use crate::conversation::Role;

/// Sleep for `latency`, returning `Cancelled` if the token fires first.
async fn simulated_latency(latency: Duration, cancel: &CancellationToken) -> PortResult<()> {
    if latency.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(PortError::Cancelled),
        _ = tokio::time::sleep(latency) => Ok(()),
    }
}

/// Reports segment length and energy instead of words.
///
/// `"[speech 1500 ms]"` for a 1.5 s segment, with confidence derived from
/// the segment's average energy.
#[derive(Debug, Clone, Default)]
pub struct StubTranscriber {
    pub latency: Duration,
}

#[async_trait]
impl TranscriptionPort for StubTranscriber {
    async fn transcribe(
        &self,
        request: &TranscriptionRequest,
        cancel: &CancellationToken,
    ) -> PortResult<Transcript> {
        simulated_latency(self.latency, cancel).await?;
        let segment = &request.segment;
        let confidence = (segment.average_energy * 10.0).clamp(0.0, 1.0);
        debug!(
            segment_id = segment.id,
            confidence, "StubTranscriber::transcribe"
        );
        Ok(Transcript {
            text: format!("[speech {:.0} ms]", segment.duration_ms()),
            confidence,
        })
    }
}

/// Echoes the most recent human turn back.
#[derive(Debug, Clone, Default)]
pub struct EchoGenerator {
    pub latency: Duration,
}

#[async_trait]
impl GenerationPort for EchoGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> PortResult<String> {
        simulated_latency(self.latency, cancel).await?;
        let last_human = request
            .context
            .turns
            .iter()
            .rev()
            .find(|t| t.role == Role::Human)
            .map(|t| t.text.as_str())
            .unwrap_or_default();
        if last_human.is_empty() {
            return Ok(String::new());
        }
        Ok(format!("You said: {last_human}"))
    }
}

/// Renders text as a sine tone, `ms_per_char` long per character.
#[derive(Debug, Clone)]
pub struct ToneSynthesizer {
    pub latency: Duration,
    pub ms_per_char: u32,
    pub frequency_hz: f32,
}

impl Default for ToneSynthesizer {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            ms_per_char: 20,
            frequency_hz: 440.0,
        }
    }
}

#[async_trait]
impl SynthesisPort for ToneSynthesizer {
    async fn synthesize(
        &self,
        request: &SynthesisRequest,
        cancel: &CancellationToken,
    ) -> PortResult<SynthesizedAudio> {
        simulated_latency(self.latency, cancel).await?;
        if request.text.trim().is_empty() {
            return Err(PortError::Permanent("nothing to synthesize".into()));
        }
        let rate = request.sample_rate.max(1);
        let chars = request.text.chars().count() as u64;
        let duration_ms = (chars * self.ms_per_char as u64) as f32 / request.voice.speed.max(0.25);
        let len = (rate as f32 * duration_ms / 1000.0) as usize;
        let step = TAU * self.frequency_hz / rate as f32;
        let samples = (0..len).map(|i| (i as f32 * step).sin() * 0.2).collect();
        Ok(SynthesizedAudio {
            samples,
            sample_rate: rate,
        })
    }
}
