//! Streaming inference back-end client
//!
//! Consumes the two endpoints the conversational back end exposes: the
//! chunked "ask" stream and the unary external-message log. The reply
//! stream yields raw UTF-8 bytes with no framing of its own; chunks are
//! decoded incrementally and re-sliced downstream at sentence
//! boundaries, never at network-chunk boundaries.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;

use callbridge_config::BackendConfig;
use callbridge_core::{CancelToken, ConversationTurn, Error, InferenceClient, Result};

/// HTTP client for the conversational inference back end.
pub struct RagClient {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct AskRequest<'a> {
    question: &'a str,
    history: Vec<HistoryItem<'a>>,
}

#[derive(Serialize)]
struct HistoryItem<'a> {
    user: &'a str,
    assistant: &'a str,
}

#[derive(Serialize)]
struct ExternalMessage<'a> {
    role: &'a str,
    content: &'a str,
}

impl RagClient {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        // No overall request timeout: the ask response streams for the
        // whole turn. Read pacing is enforced by the controller.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl InferenceClient for RagClient {
    async fn stream_ask(
        &self,
        conversation_id: &str,
        user_text: &str,
        history: &[ConversationTurn],
        cancel: CancelToken,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        let request = AskRequest {
            question: user_text,
            history: history
                .iter()
                .map(|turn| HistoryItem {
                    user: &turn.user_text,
                    assistant: &turn.reply_text,
                })
                .collect(),
        };

        let response = self
            .client
            .post(format!(
                "{}/api/conversations/{}/ask",
                self.base_url, conversation_id
            ))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("ask request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Backend(format!("ask returned {status}: {body}")));
        }

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut carry: Vec<u8> = Vec::new();

            while let Some(item) = stream.next().await {
                if cancel.is_cancelled() {
                    tracing::debug!("ask stream cancelled between chunks");
                    return;
                }
                match item {
                    Ok(bytes) => {
                        carry.extend_from_slice(&bytes);
                        let text = take_valid_utf8(&mut carry);
                        if !text.is_empty() && tx.send(Ok(text)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(Error::Backend(format!("ask stream broke: {e}"))))
                            .await;
                        return;
                    }
                }
            }

            if !carry.is_empty() {
                let tail = String::from_utf8_lossy(&carry).into_owned();
                let _ = tx.send(Ok(tail)).await;
            }
        });

        Ok(rx)
    }

    async fn add_external_message(&self, conversation_id: &str, text: &str) -> Result<()> {
        let message = ExternalMessage {
            role: "assistant",
            content: text,
        };

        let response = self
            .client
            .post(format!(
                "{}/api/conversations/{}/messages",
                self.base_url, conversation_id
            ))
            .json(&message)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("message log failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Backend(format!("message log returned {status}")));
        }
        Ok(())
    }
}

/// Extract the longest valid UTF-8 prefix, keeping an incomplete
/// trailing code point for the next network chunk.
fn take_valid_utf8(carry: &mut Vec<u8>) -> String {
    match std::str::from_utf8(carry) {
        Ok(s) => {
            let text = s.to_string();
            carry.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let tail = carry.split_off(e.valid_up_to());
            let head = std::mem::replace(carry, tail);
            // The prefix was just validated.
            String::from_utf8(head).unwrap_or_default()
        }
        Err(_) => {
            // Genuinely invalid bytes mid-stream; decode lossily rather
            // than stall the reply.
            let text = String::from_utf8_lossy(carry).into_owned();
            carry.clear();
            text
        }
    }
}
