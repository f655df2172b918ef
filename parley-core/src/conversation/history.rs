//! Capped, insertion-ordered dialogue history.

use std::collections::VecDeque;

use super::{ConversationTurn, Role};

/// Ordered turns, never longer than `cap`.
///
/// System turns (the preamble) are pinned: when the cap is reached the
/// oldest non-system turn is evicted first. Only if every stored turn is
/// pinned does the oldest pinned turn go.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    turns: VecDeque<ConversationTurn>,
    cap: usize,
    evicted: u64,
}

impl ConversationHistory {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            turns: VecDeque::with_capacity(cap),
            cap,
            evicted: 0,
        }
    }

    /// Append a turn, returning the turn evicted to make room, if any.
    pub fn push(&mut self, turn: ConversationTurn) -> Option<ConversationTurn> {
        let evicted = if self.turns.len() >= self.cap {
            let idx = self
                .turns
                .iter()
                .position(|t| !is_pinned(t))
                .unwrap_or(0);
            self.evicted += 1;
            self.turns.remove(idx)
        } else {
            None
        };
        self.turns.push_back(turn);
        evicted
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Total turns evicted over the history's lifetime.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    pub fn count_role(&self, role: Role) -> usize {
        self.turns.iter().filter(|t| t.role == role).count()
    }
}

fn is_pinned(turn: &ConversationTurn) -> bool {
    turn.role == Role::System
}
