//! Core traits and types for the call mediation engine
//!
//! This crate provides the foundations shared by all other crates:
//! - Telephony media codec (mu-law, resampling, framing)
//! - Wire frame and utterance event types
//! - Call phase and conversation state
//! - Cooperative cancellation token
//! - Collaborator traits for pluggable ASR/TTS/back-end providers
//! - Error types

pub mod cancel;
pub mod codec;
pub mod conversation;
pub mod error;
pub mod event;
pub mod frame;
pub mod phase;
pub mod traits;

pub use cancel::CancelToken;
pub use conversation::{ConversationHistory, ConversationTurn};
pub use error::{Error, Result};
pub use event::{Transcript, UtteranceEvent, UtteranceKind};
pub use frame::{AudioFrame, MediaDirection};
pub use phase::CallPhase;
pub use traits::{AsrStream, InferenceClient, OutboundSink, SpeechRecognizer, SpeechSynthesizer};

/// Wire sample rate: telephony media streams are fixed at 8kHz mono mu-law.
pub const WIRE_RATE_HZ: u32 = 8000;

/// Nominal wire frame cadence in milliseconds.
pub const WIRE_FRAME_MS: u32 = 20;
