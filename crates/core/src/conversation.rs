//! In-memory conversation state

use serde::{Deserialize, Serialize};

/// One question/answer pair in a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Finalized caller utterance
    pub user_text: String,
    /// Finalized system reply; on interruption this is only the part
    /// that was actually spoken
    pub reply_text: String,
    /// Turn start offset in ms relative to session start
    pub started_at_ms: u64,
    /// Wall-clock duration of the turn in ms
    pub elapsed_ms: u64,
    /// Whether the caller cut the reply short
    pub interrupted: bool,
}

/// Conversation history for one call session.
///
/// Mutated only by the dialogue controller; handed to the inference
/// back end as context on every turn.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    turns: Vec<ConversationTurn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.last()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_push() {
        let mut history = ConversationHistory::new();
        assert!(history.is_empty());

        history.push(ConversationTurn {
            user_text: "Bonjour".into(),
            reply_text: "Bonjour, comment puis-je vous aider ?".into(),
            started_at_ms: 1200,
            elapsed_ms: 1800,
            interrupted: false,
        });

        assert_eq!(history.turn_count(), 1);
        assert_eq!(history.last().unwrap().user_text, "Bonjour");
    }
}
