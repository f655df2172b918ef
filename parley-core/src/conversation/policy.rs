//! Response-worthiness policies.

use std::sync::Arc;

use super::{ConversationHistory, Utterance};
use crate::config::{PipelineConfig, ResponseMode};

/// Decides whether the agent should answer a committed utterance.
pub trait ResponsePolicy: Send + Sync + 'static {
    fn should_respond(&self, utterance: &Utterance, history: &ConversationHistory) -> bool;
}

/// Answers every non-empty utterance.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRespond;

impl ResponsePolicy for AlwaysRespond {
    fn should_respond(&self, utterance: &Utterance, _history: &ConversationHistory) -> bool {
        !utterance.text.trim().is_empty()
    }
}

const QUESTION_WORDS: &[&str] = &["what", "how", "why", "when", "where", "who"];
const QUESTION_PHRASES: &[&str] = &["can you", "could you"];
const GREETING_WORDS: &[&str] = &["hello", "hi", "hey"];
const GREETING_PHRASES: &[&str] = &["good morning", "good afternoon"];

/// Answers when addressed by name, asked a question or greeted. Short
/// remarks that match none of those are treated as side chatter.
#[derive(Debug, Clone)]
pub struct AddressCuePolicy {
    agent_name: String,
    min_words: usize,
}

impl AddressCuePolicy {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into().to_lowercase(),
            min_words: 3,
        }
    }

    pub fn with_min_words(mut self, min_words: usize) -> Self {
        self.min_words = min_words;
        self
    }

    fn mentions_agent(&self, lower: &str) -> bool {
        if self.agent_name.is_empty() {
            return false;
        }
        if lower.contains(&self.agent_name) {
            return true;
        }
        // "AI Assistant" is also addressed as just "assistant".
        self.agent_name
            .split_whitespace()
            .filter(|part| part.len() > 2)
            .any(|part| words(lower).any(|w| w == part))
    }
}

impl ResponsePolicy for AddressCuePolicy {
    fn should_respond(&self, utterance: &Utterance, _history: &ConversationHistory) -> bool {
        let lower = utterance.text.trim().to_lowercase();
        if lower.is_empty() {
            return false;
        }
        if self.mentions_agent(&lower) {
            return true;
        }
        if lower.contains('?')
            || QUESTION_PHRASES.iter().any(|p| lower.contains(p))
            || words(&lower).any(|w| QUESTION_WORDS.contains(&w))
        {
            return true;
        }
        if GREETING_PHRASES.iter().any(|p| lower.contains(p))
            || words(&lower).any(|w| GREETING_WORDS.contains(&w))
        {
            return true;
        }
        words(&lower).count() >= self.min_words
    }
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
}

/// Build the policy selected by `responseMode`.
pub fn policy_for(config: &PipelineConfig) -> Arc<dyn ResponsePolicy> {
    match config.response_mode {
        ResponseMode::Always => Arc::new(AlwaysRespond),
        ResponseMode::AddressCue => Arc::new(AddressCuePolicy::new(config.agent_name.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utterance(text: &str) -> Utterance {
        Utterance::from_text(text)
    }

    #[test]
    fn always_respond_skips_only_blank_text() {
        let history = ConversationHistory::new(4);
        assert!(AlwaysRespond.should_respond(&utterance("ok"), &history));
        assert!(!AlwaysRespond.should_respond(&utterance("   "), &history));
    }

    #[test]
    fn address_cues() {
        let history = ConversationHistory::new(4);
        let policy = AddressCuePolicy::new("AI Assistant");
        assert!(policy.should_respond(&utterance("thanks assistant"), &history));
        assert!(policy.should_respond(&utterance("Ready?"), &history));
        assert!(policy.should_respond(&utterance("why though"), &history));
        assert!(policy.should_respond(&utterance("hey"), &history));
        assert!(policy.should_respond(&utterance("Good morning all"), &history));
        assert!(policy.should_respond(
            &utterance("let us move on to the budget"),
            &history
        ));
        assert!(!policy.should_respond(&utterance("mm okay"), &history));
        assert!(!policy.should_respond(&utterance("somewhat"), &history));
    }

    #[test]
    fn config_selects_policy() {
        let mut config = PipelineConfig::default();
        config.response_mode = ResponseMode::AddressCue;
        let history = ConversationHistory::new(4);
        let policy = policy_for(&config);
        assert!(!policy.should_respond(&utterance("yeah sure"), &history));
        config.response_mode = ResponseMode::Always;
        assert!(policy_for(&config).should_respond(&utterance("yeah sure"), &history));
    }
}
