//! Dialogue state: turns, bounded history, prompt context and the
//! response-worthiness decision.
//!
//! The orchestrator is the only writer. Turns are appended once they are
//! final: a human turn after a transcript passes the confidence gate, an
//! agent turn only after its audio finished playing.

pub mod history;
pub mod log;
pub mod policy;

pub use history::ConversationHistory;
pub use log::{read_log, ConversationLog, LogRecord};
pub use policy::{policy_for, AddressCuePolicy, AlwaysRespond, ResponsePolicy};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::PipelineConfig;

const HINT_TURNS: usize = 5;
const MAX_TOPICS: usize = 10;
const TOPICS_PER_EXCHANGE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Agent,
    /// Pinned session preamble.
    System,
}

/// A finalized turn. Never modified once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub id: u64,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(id: u64, role: Role, text: impl Into<String>) -> Self {
        Self {
            id,
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Transcription result (or typed chat input) that passed the gate.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    pub confidence: f32,
    /// Source segment; `None` for text input.
    pub segment_id: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl Utterance {
    pub fn new(text: impl Into<String>, confidence: f32, segment_id: Option<u64>) -> Self {
        Self {
            text: text.into(),
            confidence,
            segment_id,
            timestamp: Utc::now(),
        }
    }

    /// Typed input is taken at face value.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self::new(text, 1.0, None)
    }
}

/// What the generation port sees.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptContext {
    pub preamble: Option<String>,
    /// Oldest first; never contains system turns.
    pub turns: Vec<ConversationTurn>,
}

impl PromptContext {
    pub fn last_human(&self) -> Option<&ConversationTurn> {
        self.turns.iter().rev().find(|t| t.role == Role::Human)
    }

    pub fn char_count(&self) -> usize {
        self.turns.iter().map(|t| t.text.chars().count()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub total_turns: usize,
    pub human_turns: usize,
    pub agent_turns: usize,
    pub session_secs: f64,
    pub recent_topics: Vec<String>,
}

pub struct ConversationManager {
    history: ConversationHistory,
    policy: Arc<dyn ResponsePolicy>,
    log: Option<ConversationLog>,
    next_turn_id: u64,
    context_max_turns: usize,
    context_max_chars: usize,
    preamble: String,
    topics: VecDeque<String>,
    session_started: Option<Instant>,
}

impl ConversationManager {
    pub fn new(config: &PipelineConfig, policy: Arc<dyn ResponsePolicy>) -> Self {
        Self {
            history: ConversationHistory::new(config.history_cap),
            policy,
            log: None,
            next_turn_id: 1,
            context_max_turns: config.context_max_turns.max(1),
            context_max_chars: config.context_max_chars.max(1),
            preamble: config.effective_preamble(),
            topics: VecDeque::with_capacity(MAX_TOPICS),
            session_started: None,
        }
    }

    pub fn with_log(mut self, log: ConversationLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Pin the preamble and start the session clock. Calling it again is a
    /// no-op.
    pub fn start_session(&mut self) {
        if self.session_started.is_some() {
            return;
        }
        self.session_started = Some(Instant::now());
        let id = self.reserve_turn_id();
        let preamble = ConversationTurn::new(id, Role::System, self.preamble.clone());
        self.commit(preamble);
    }

    /// Allocate the id for a turn that may or may not be committed. Ids of
    /// abandoned turns are never reused.
    pub fn reserve_turn_id(&mut self) -> u64 {
        let id = self.next_turn_id;
        self.next_turn_id += 1;
        id
    }

    pub fn should_respond(&self, utterance: &Utterance) -> bool {
        self.policy.should_respond(utterance, &self.history)
    }

    /// Commit a human turn under an id taken from `reserve_turn_id`.
    pub fn commit_human(&mut self, turn_id: u64, utterance: &Utterance) -> ConversationTurn {
        self.commit(ConversationTurn::new(turn_id, Role::Human, utterance.text.trim()))
    }

    /// Commit the agent's reply once its audio finished playing.
    pub fn commit_agent(&mut self, text: &str) -> ConversationTurn {
        let id = self.reserve_turn_id();
        let turn = self.commit(ConversationTurn::new(id, Role::Agent, text.trim()));
        self.note_topics();
        turn
    }

    fn commit(&mut self, turn: ConversationTurn) -> ConversationTurn {
        if let Some(evicted) = self.history.push(turn.clone()) {
            debug!(turn_id = evicted.id, "history cap reached, evicted oldest turn");
        }
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.append(&turn) {
                warn!("Failed to append conversation log: {}", e);
            }
        }
        turn
    }

    /// Preamble plus the newest turns that fit the turn and character
    /// budgets, returned oldest first. The newest turn is always included.
    pub fn build_context(&self) -> PromptContext {
        let mut picked = Vec::new();
        let mut chars = 0usize;
        for turn in self.history.iter().rev().filter(|t| t.role != Role::System) {
            let len = turn.text.chars().count();
            if !picked.is_empty()
                && (picked.len() >= self.context_max_turns || chars + len > self.context_max_chars)
            {
                break;
            }
            chars += len;
            picked.push(turn.clone());
        }
        picked.reverse();

        let preamble = self
            .history
            .iter()
            .find(|t| t.role == Role::System)
            .map(|t| t.text.clone());
        PromptContext {
            preamble,
            turns: picked,
        }
    }

    /// Recent dialogue rendered for the transcriber's vocabulary bias.
    pub fn transcription_hint(&self) -> Option<String> {
        let recent: Vec<&ConversationTurn> = self
            .history
            .iter()
            .rev()
            .filter(|t| t.role != Role::System)
            .take(HINT_TURNS)
            .collect();
        if recent.is_empty() {
            return None;
        }
        let lines: Vec<String> = recent
            .iter()
            .rev()
            .map(|t| {
                let who = if t.role == Role::Human { "Human" } else { "Agent" };
                format!("{who}: {}", t.text)
            })
            .collect();
        Some(lines.join("\n"))
    }

    fn note_topics(&mut self) {
        let mut recent: Vec<String> = self
            .history
            .iter()
            .rev()
            .filter(|t| t.role != Role::System)
            .take(2)
            .map(|t| t.text.to_lowercase())
            .collect();
        recent.reverse();
        let text = recent.join(" ");
        let fresh: Vec<String> = text
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphabetic()))
            .filter(|w| w.len() > 3 && w.chars().all(char::is_alphabetic))
            .map(str::to_owned)
            .take(TOPICS_PER_EXCHANGE)
            .collect();
        for word in fresh {
            if self.topics.contains(&word) {
                continue;
            }
            if self.topics.len() == MAX_TOPICS {
                self.topics.pop_front();
            }
            self.topics.push_back(word);
        }
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            total_turns: self.history.len(),
            human_turns: self.history.count_role(Role::Human),
            agent_turns: self.history.count_role(Role::Agent),
            session_secs: self
                .session_started
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0),
            recent_topics: self.topics.iter().cloned().collect(),
        }
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn turns(&self) -> Vec<ConversationTurn> {
        self.history.iter().cloned().collect()
    }
}
