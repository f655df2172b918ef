use thiserror::Error;

use crate::ports::PortKind;

/// All errors produced by parley-core.
#[derive(Debug, Error)]
pub enum ParleyError {
    /// Capture or playback device failure. Fatal: the pipeline must shut down.
    #[error("audio device error: {0}")]
    Device(String),

    #[error("no default {0} device found")]
    NoDefaultDevice(&'static str),

    #[error("{port} port timed out after {attempts} attempt(s)")]
    PortTimeout { port: PortKind, attempts: u32 },

    #[error("{port} port failed after {attempts} attempt(s): {reason}")]
    PortFailure {
        port: PortKind,
        attempts: u32,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("pipeline is already running")]
    AlreadyRunning,

    #[error("pipeline is not running")]
    NotRunning,

    #[error("text input queue is full")]
    InputQueueFull,

    /// Mute or chat call rejected by the meeting platform. Logged, never fatal.
    #[error("meeting channel error: {0}")]
    Meeting(String),

    #[error("conversation log error: {0}")]
    Log(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ParleyError>;
