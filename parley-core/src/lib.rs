//! # parley-core
//!
//! Real-time conversational audio engine: listens to a meeting, decides when
//! a human has finished speaking, and answers out loud through remote
//! transcription, generation and synthesis services.
//!
//! ## Architecture
//!
//! ```text
//! AudioSource → capture thread → frame queue (drop-oldest) → VAD thread
//!                                                               │
//!                                                         SpeechSegment
//!                                                               │
//!                             Orchestrator (tokio task, one turn at a time)
//!                 TranscriptionPort → ConversationManager → GenerationPort
//!                                                               │
//!                                                        SynthesisPort
//!                                                               │
//!                          SPSC ring → playback thread → AudioSink
//! ```
//!
//! Speech arriving while the agent is generating, synthesizing or speaking
//! cancels the active turn (barge-in) and becomes the next turn.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod events;
pub mod meeting;
pub mod ports;
pub mod vad;

// Convenience re-exports for downstream crates
pub use audio::{AudioSink, AudioSource, SinkFactory, SourceFactory};
pub use config::{load_config, save_config, PipelineConfig, ResponseMode};
pub use conversation::{ConversationManager, ConversationTurn, ResponsePolicy, Role, Utterance};
pub use engine::{DiagnosticsSnapshot, ParleyEngine};
pub use error::{ParleyError, Result};
pub use events::{DiscardReason, PipelineEvent, PipelineStage, PipelineState};
pub use meeting::MeetingChannel;
pub use ports::{GenerationPort, Ports, SynthesisPort, TranscriptionPort};
