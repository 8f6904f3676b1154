//! Utterance events emitted by the inbound pipeline

use serde::{Deserialize, Serialize};

/// Kind of utterance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtteranceKind {
    /// Voice activity crossed the speech threshold
    SpeechStarted,
    /// Interim transcript, may be revised
    Partial,
    /// Finalized transcript for the utterance
    Final,
    /// Voice activity fell back below the silence threshold
    SpeechEnded,
}

/// One recognition event for a single utterance.
///
/// Events for any utterance arrive in the order
/// `SpeechStarted`, zero or more `Partial`, `Final`, `SpeechEnded`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtteranceEvent {
    pub kind: UtteranceKind,
    /// Transcript text; empty for pure voice-activity events and for
    /// finals produced by recognizer failure.
    pub text: String,
    /// Recognizer confidence in [0, 1]; 0 for synthetic events.
    pub confidence: f32,
    /// Utterance start offset in ms relative to session start
    pub start_ms: u64,
    /// Event offset in ms relative to session start
    pub end_ms: u64,
}

impl UtteranceEvent {
    pub fn speech_started(at_ms: u64) -> Self {
        Self {
            kind: UtteranceKind::SpeechStarted,
            text: String::new(),
            confidence: 0.0,
            start_ms: at_ms,
            end_ms: at_ms,
        }
    }

    pub fn partial(text: impl Into<String>, confidence: f32, start_ms: u64, end_ms: u64) -> Self {
        Self {
            kind: UtteranceKind::Partial,
            text: text.into(),
            confidence,
            start_ms,
            end_ms,
        }
    }

    pub fn final_transcript(
        text: impl Into<String>,
        confidence: f32,
        start_ms: u64,
        end_ms: u64,
    ) -> Self {
        Self {
            kind: UtteranceKind::Final,
            text: text.into(),
            confidence,
            start_ms,
            end_ms,
        }
    }

    /// Final produced when the recognizer stream failed mid-utterance.
    pub fn empty_final(start_ms: u64, end_ms: u64) -> Self {
        Self::final_transcript(String::new(), 0.0, start_ms, end_ms)
    }

    pub fn speech_ended(start_ms: u64, end_ms: u64) -> Self {
        Self {
            kind: UtteranceKind::SpeechEnded,
            text: String::new(),
            confidence: 0.0,
            start_ms,
            end_ms,
        }
    }

    pub fn is_final(&self) -> bool {
        self.kind == UtteranceKind::Final
    }
}

/// Recognizer output: a transcript hypothesis or finalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub confidence: f32,
    /// True when the recognizer considers this hypothesis final.
    pub is_final: bool,
}

impl Transcript {
    pub fn partial(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
            is_final: false,
        }
    }

    pub fn final_result(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
            is_final: true,
        }
    }
}
