//! Collaborator traits
//!
//! The engine treats ASR, TTS, the conversational back end, and the
//! provider-facing media sink as external collaborators behind these
//! seams. Concrete variants are selected by configuration and injected
//! into the session runtime at construction; nothing is global.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::cancel::CancelToken;
use crate::conversation::ConversationTurn;
use crate::error::Result;
use crate::event::Transcript;

/// Streaming speech recognizer factory.
///
/// One stream covers one utterance: opened on speech start, fed PCM16
/// chunks, closed on speech end for the final transcript. Interim
/// hypotheses are delivered through the `updates` channel while the
/// stream is open.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn open_stream(&self, updates: mpsc::Sender<Transcript>) -> Result<Box<dyn AsrStream>>;
}

/// One open recognition stream.
#[async_trait]
pub trait AsrStream: Send + Sync {
    /// Push a PCM16 chunk into the stream.
    async fn send(&mut self, pcm16: &[u8]) -> Result<()>;

    /// Close the stream and return the final transcript.
    async fn close(self: Box<Self>) -> Result<Transcript>;
}

/// Speech synthesizer.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize text to PCM16 at [`native_rate`](Self::native_rate).
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;

    /// Sample rate of synthesized audio in Hz.
    fn native_rate(&self) -> u32;
}

/// Streaming conversational inference back end.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Ask a question and stream the reply.
    ///
    /// The receiver yields text deltas as they arrive; a clean channel
    /// close means the reply is complete, an `Err` item means the
    /// stream broke. Cancellation is cooperative and observed between
    /// chunks.
    async fn stream_ask(
        &self,
        conversation_id: &str,
        user_text: &str,
        history: &[ConversationTurn],
        cancel: CancelToken,
    ) -> Result<mpsc::Receiver<Result<String>>>;

    /// Record system-spoken text (greeting, fallback, partial reply)
    /// in the back-end conversation. Fire and forget.
    async fn add_external_message(&self, conversation_id: &str, text: &str) -> Result<()>;
}

/// Outbound side of the provider media WebSocket.
///
/// Exactly one task (the speech sender) writes media through this sink;
/// implementations serialize writes internally.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    /// Send one base64-encoded mu-law media segment.
    async fn send_media(&self, payload_b64: &str) -> Result<()>;

    /// Send a playback marker.
    async fn send_mark(&self, name: &str) -> Result<()>;
}
