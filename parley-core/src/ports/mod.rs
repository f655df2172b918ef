//! Remote capability ports.
//!
//! Transcription, generation and synthesis are each a single async call:
//! `request → result | PortError`. Every call receives a `CancellationToken`
//! that implementations should poll (or `select!` on) so a barge-in can
//! abort a slow request mid-flight. Timeouts and retries are applied by
//! `retry::call_with_retry`, not by the implementations.
//!
//! New providers implement the trait; the orchestrator never changes.

pub mod retry;
pub mod stub;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::buffering::segment::SpeechSegment;
use crate::config::VoiceSettings;
use crate::conversation::PromptContext;

pub use retry::{call_with_retry, CallError, RetryPolicy};

/// Which port a call or failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    Transcription,
    Generation,
    Synthesis,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortKind::Transcription => "transcription",
            PortKind::Generation => "generation",
            PortKind::Synthesis => "synthesis",
        };
        f.write_str(name)
    }
}

/// Failure kinds a port implementation reports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    /// Worth retrying (rate limit, 5xx, connection reset).
    #[error("transient failure: {0}")]
    Transient(String),
    /// Retrying will not help (bad request, auth).
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("call timed out")]
    Timeout,
    /// The implementation observed the cancellation token.
    #[error("call cancelled")]
    Cancelled,
}

impl PortError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PortError::Transient(_) | PortError::Timeout)
    }
}

pub type PortResult<T> = std::result::Result<T, PortError>;

#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub segment: Arc<SpeechSegment>,
    /// Recent dialogue text to bias recognition.
    pub context_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    /// Confidence in [0.0, 1.0].
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub context: PromptContext,
}

#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: VoiceSettings,
    /// Rate the pipeline plays back at; implementations should resample to it.
    pub sample_rate: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

#[async_trait]
pub trait TranscriptionPort: Send + Sync + 'static {
    async fn transcribe(
        &self,
        request: &TranscriptionRequest,
        cancel: &CancellationToken,
    ) -> PortResult<Transcript>;
}

#[async_trait]
pub trait GenerationPort: Send + Sync + 'static {
    /// Produce the agent's reply text. An empty string means "nothing to say".
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> PortResult<String>;
}

#[async_trait]
pub trait SynthesisPort: Send + Sync + 'static {
    async fn synthesize(
        &self,
        request: &SynthesisRequest,
        cancel: &CancellationToken,
    ) -> PortResult<SynthesizedAudio>;
}

/// The three remote capabilities the orchestrator drives.
#[derive(Clone)]
pub struct Ports {
    pub transcription: Arc<dyn TranscriptionPort>,
    pub generation: Arc<dyn GenerationPort>,
    pub synthesis: Arc<dyn SynthesisPort>,
}

impl Ports {
    pub fn new(
        transcription: impl TranscriptionPort,
        generation: impl GenerationPort,
        synthesis: impl SynthesisPort,
    ) -> Self {
        Self {
            transcription: Arc::new(transcription),
            generation: Arc::new(generation),
            synthesis: Arc::new(synthesis),
        }
    }
}

impl fmt::Debug for Ports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ports").finish_non_exhaustive()
    }
}

/// Split text into chunks of at most `max_chars`, on sentence boundaries
/// where possible. Sentences longer than `max_chars` are hard-split.
pub fn split_text_for_synthesis(text: &str, max_chars: usize) -> Vec<String> {
    let text = text.trim();
    let max_chars = max_chars.max(1);
    if text.is_empty() {
        return Vec::new();
    }
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            sentences.push(std::mem::take(&mut current));
        }
    }
    if !current.trim().is_empty() {
        sentences.push(current);
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut chunk = String::new();
    for sentence in sentences {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }
        let joined_len = chunk.chars().count() + 1 + sentence.chars().count();
        if !chunk.is_empty() && joined_len <= max_chars {
            chunk.push(' ');
            chunk.push_str(sentence);
            continue;
        }
        if !chunk.is_empty() {
            chunks.push(std::mem::take(&mut chunk));
        }
        if sentence.chars().count() <= max_chars {
            chunk.push_str(sentence);
        } else {
            let chars: Vec<char> = sentence.chars().collect();
            for piece in chars.chunks(max_chars) {
                chunks.push(piece.iter().collect::<String>().trim().to_string());
            }
        }
    }
    if !chunk.is_empty() {
        chunks.push(chunk);
    }
    chunks.retain(|c| !c.is_empty());
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_text_for_synthesis("  Hi there.  ", 40), vec!["Hi there."]);
        assert!(split_text_for_synthesis("   ", 40).is_empty());
    }

    #[test]
    fn long_text_splits_on_sentences() {
        let text = "First sentence here. Second one follows! Is this the third? Yes.";
        let chunks = split_text_for_synthesis(text, 30);
        assert_eq!(
            chunks,
            vec![
                "First sentence here.",
                "Second one follows!",
                "Is this the third? Yes.",
            ]
        );
        assert!(chunks.iter().all(|c| c.chars().count() <= 30));
    }

    #[test]
    fn oversized_sentence_is_hard_split() {
        let text = "abcdefghij".repeat(5);
        let chunks = split_text_for_synthesis(&text, 20);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn retryable_classification() {
        assert!(PortError::Transient("503".into()).is_retryable());
        assert!(PortError::Timeout.is_retryable());
        assert!(!PortError::Permanent("401".into()).is_retryable());
        assert!(!PortError::Cancelled.is_retryable());
    }

    #[test]
    fn port_kind_serializes_lowercase() {
        let json = serde_json::to_string(&PortKind::Synthesis).expect("serialize");
        assert_eq!(json, "\"synthesis\"");
        assert_eq!(PortKind::Generation.to_string(), "generation");
    }
}
