//! Call session phase

use serde::{Deserialize, Serialize};

/// Phase of one live call.
///
/// Transitions are owned by the dialogue controller except for
/// `Starting -> Listening` (session start) and `* -> Ended` (hangup),
/// which the session runtime performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    /// WebSocket connected, waiting for the provider start event
    #[default]
    Starting,
    /// Waiting for the caller to speak
    Listening,
    /// Utterance finalized, waiting for the first back-end token
    Thinking,
    /// Reply audio is queued or in flight
    Speaking,
    /// Call torn down
    Ended,
}

impl CallPhase {
    /// Whether the session still processes media in this phase.
    pub fn is_live(&self) -> bool {
        !matches!(self, CallPhase::Ended)
    }
}

impl std::fmt::Display for CallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CallPhase::Starting => "starting",
            CallPhase::Listening => "listening",
            CallPhase::Thinking => "thinking",
            CallPhase::Speaking => "speaking",
            CallPhase::Ended => "ended",
        };
        f.write_str(name)
    }
}
