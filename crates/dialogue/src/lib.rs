//! Dialogue layer for the call mediation engine
//!
//! Owns the per-turn conversation state machine, the interruption
//! protocol, and the streaming client for the external inference back
//! end. Audio never flows through this crate; it moves text between
//! the inbound pipeline's utterance events and the outbound pipeline's
//! text queue.

pub mod client;
pub mod controller;

pub use client::RagClient;
pub use controller::{
    ControllerConfig, DialogueController, FALLBACK_SENTENCE, NUDGE_SENTENCE,
};
