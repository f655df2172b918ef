//! The meeting the agent sits in, seen only through mute and chat.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;

/// Narrow handle onto the meeting platform.
///
/// Implementations report failures as `ParleyError::Meeting`. The
/// orchestrator logs them and carries on: a flaky chat box never ends a
/// conversation.
#[async_trait]
pub trait MeetingChannel: Send + Sync {
    async fn set_muted(&self, muted: bool) -> Result<()>;
    async fn send_message(&self, text: &str) -> Result<()>;
}

/// What a `RecordingChannel` saw, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCall {
    Mute(bool),
    Message(String),
}

/// In-memory channel for simulations and tests.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    calls: Mutex<Vec<ChannelCall>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ChannelCall> {
        self.calls.lock().clone()
    }

    /// Last mute state set, if any.
    pub fn is_muted(&self) -> Option<bool> {
        self.calls.lock().iter().rev().find_map(|c| match c {
            ChannelCall::Mute(m) => Some(*m),
            ChannelCall::Message(_) => None,
        })
    }

    pub fn messages(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                ChannelCall::Message(m) => Some(m.clone()),
                ChannelCall::Mute(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl MeetingChannel for RecordingChannel {
    async fn set_muted(&self, muted: bool) -> Result<()> {
        self.calls.lock().push(ChannelCall::Mute(muted));
        Ok(())
    }

    async fn send_message(&self, text: &str) -> Result<()> {
        self.calls.lock().push(ChannelCall::Message(text.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_channel_keeps_call_order() {
        let channel = RecordingChannel::new();
        assert_eq!(channel.is_muted(), None);
        channel.set_muted(true).await.unwrap();
        channel.send_message("hi there").await.unwrap();
        channel.set_muted(false).await.unwrap();

        assert_eq!(channel.is_muted(), Some(false));
        assert_eq!(channel.messages(), vec!["hi there".to_string()]);
        assert_eq!(channel.calls().len(), 3);
    }
}
