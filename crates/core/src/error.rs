//! Error types shared across the engine

use thiserror::Error;

/// Errors raised by the call mediation components.
///
/// Recoverable variants are handled at the component that produced
/// them; only `Fatal` propagates to the session runtime, which closes
/// the call.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("ASR error: {0}")]
    Asr(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timeout")]
    Timeout,

    #[error("Fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Whether the session runtime must tear the call down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
