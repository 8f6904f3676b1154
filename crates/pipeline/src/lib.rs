//! Media pipelines for the call mediation engine
//!
//! This crate provides both directions of per-call audio processing:
//! - Inbound: energy VAD with hysteresis, a streaming-recognizer
//!   bridge with an endpointing override, and utterance event emission
//! - Outbound: the sentence-splitting text queue and the paced speech
//!   sender with barge-in support
//! - Configuration-selected ASR and TTS provider variants (cloud/local)
//!
//! Errors use the shared [`callbridge_core::Error`] taxonomy; every
//! fallible operation here crosses a collaborator trait typed with it.

pub mod asr;
pub mod inbound;
pub mod sender;
pub mod text_queue;
pub mod tts;
pub mod vad;

pub use asr::{create_recognizer, CloudRecognizer, LocalRecognizer};
pub use inbound::{InboundConfig, InboundHandle, InboundPipeline};
pub use sender::{SenderConfig, SenderEvent, SenderHandle, SpeechSender};
pub use text_queue::{
    split_boundary, TextChunk, TextQueue, MAX_CHARS_FOR_INTERRUPTIBLE_SPEECH,
};
pub use tts::{create_synthesizer, CloudSynthesizer, LocalSynthesizer};
pub use vad::{energy_db, EnergyVad, VadConfig, VadEvent, VadState};
