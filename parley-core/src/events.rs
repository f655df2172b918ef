//! Pipeline state and the events broadcast to observers.
//!
//! Events are serialisable so a host can forward them over its own IPC
//! without a translation layer. JSON shape: `{"type": "stateChanged", ...}`
//! with camelCase fields.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::conversation::Role;
use crate::ports::PortKind;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Turn-taking stage of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    /// Not started, or shut down.
    Idle,
    Listening,
    Transcribing,
    Generating,
    Synthesizing,
    Speaking,
    Cooldown,
}

impl PipelineStage {
    /// Stages in which a confirmed segment interrupts the agent.
    pub fn is_interruptible(self) -> bool {
        matches!(
            self,
            PipelineStage::Generating | PipelineStage::Synthesizing | PipelineStage::Speaking
        )
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Idle => "idle",
            PipelineStage::Listening => "listening",
            PipelineStage::Transcribing => "transcribing",
            PipelineStage::Generating => "generating",
            PipelineStage::Synthesizing => "synthesizing",
            PipelineStage::Speaking => "speaking",
            PipelineStage::Cooldown => "cooldown",
        };
        f.write_str(name)
    }
}

/// Snapshot published on the engine's watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub stage: PipelineStage,
    /// Set from `TRANSCRIBING` until the turn completes or is cancelled.
    pub active_turn_id: Option<u64>,
    /// The active turn's token has been signalled.
    pub cancelling: bool,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            stage: PipelineStage::Idle,
            active_turn_id: None,
            cancelling: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiscardReason {
    Empty,
    LowConfidence,
    /// Arrived while the pipeline was cooling down.
    Cooldown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PipelineEvent {
    #[serde(rename_all = "camelCase")]
    StateChanged {
        from: PipelineStage,
        to: PipelineStage,
        turn_id: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    SegmentDetected {
        segment_id: u64,
        duration_ms: f64,
        forced: bool,
    },
    #[serde(rename_all = "camelCase")]
    UtteranceDiscarded {
        segment_id: Option<u64>,
        confidence: f32,
        reason: DiscardReason,
    },
    #[serde(rename_all = "camelCase")]
    TurnCommitted { turn_id: u64, role: Role, text: String },
    /// The active turn was cancelled by new speech.
    #[serde(rename_all = "camelCase")]
    BargeIn {
        turn_id: Option<u64>,
        interrupted: PipelineStage,
    },
    /// A segment inside the post-`SPEAKING` grace window was ignored.
    #[serde(rename_all = "camelCase")]
    EchoSuppressed { segment_id: u64 },
    /// Retries exhausted; the turn was aborted.
    #[serde(rename_all = "camelCase")]
    PortFailure {
        port: PortKind,
        attempts: u32,
        timed_out: bool,
        message: String,
    },
    /// Fatal. The engine shuts down after emitting this.
    #[serde(rename_all = "camelCase")]
    DeviceError { message: String },
    #[serde(rename_all = "camelCase")]
    FramesDropped { total: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_changed_serializes_tagged_camel_case() {
        let event = PipelineEvent::StateChanged {
            from: PipelineStage::Listening,
            to: PipelineStage::Transcribing,
            turn_id: Some(4),
        };

        let json = serde_json::to_value(&event).expect("serialize state event");
        assert_eq!(json["type"], "stateChanged");
        assert_eq!(json["from"], "listening");
        assert_eq!(json["to"], "transcribing");
        assert_eq!(json["turnId"], 4);

        let round_trip: PipelineEvent =
            serde_json::from_value(json).expect("deserialize state event");
        assert_eq!(round_trip, event);
    }

    #[test]
    fn port_failure_carries_port_name() {
        let event = PipelineEvent::PortFailure {
            port: PortKind::Transcription,
            attempts: 3,
            timed_out: false,
            message: "reset".into(),
        };
        let json = serde_json::to_value(&event).expect("serialize failure event");
        assert_eq!(json["type"], "portFailure");
        assert_eq!(json["port"], "transcription");
        assert_eq!(json["timedOut"], false);
    }

    #[test]
    fn stage_rejects_non_lowercase_values() {
        assert!(serde_json::from_str::<PipelineStage>(r#""Speaking""#).is_err());
        assert_eq!(
            serde_json::from_str::<PipelineStage>(r#""cooldown""#).unwrap(),
            PipelineStage::Cooldown
        );
    }

    #[test]
    fn only_response_stages_are_interruptible() {
        assert!(PipelineStage::Speaking.is_interruptible());
        assert!(PipelineStage::Generating.is_interruptible());
        assert!(!PipelineStage::Transcribing.is_interruptible());
        assert!(!PipelineStage::Cooldown.is_interruptible());
    }
}
