//! Local recognition sidecar client
//!
//! Talks to a recognition service running on this host (typically a
//! model server sidecar). Same buffered-utterance protocol as the
//! cloud variant but with raw PCM bodies and no authentication.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;

use callbridge_config::AsrConfig;
use callbridge_core::{AsrStream, Error, Result, SpeechRecognizer, Transcript};

/// Local sidecar recognizer.
pub struct LocalRecognizer {
    client: Client,
    endpoint: String,
    sample_rate: u32,
    partial_interval_bytes: usize,
}

#[derive(Deserialize)]
struct TranscribeResponse {
    text: String,
    #[serde(default)]
    confidence: f32,
}

impl LocalRecognizer {
    pub fn new(config: &AsrConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            sample_rate: config.sample_rate,
            partial_interval_bytes: config.sample_rate as usize * 2,
        })
    }

    async fn transcribe(&self, audio: Vec<u8>, partial: bool) -> Result<TranscribeResponse> {
        let response = self
            .client
            .post(format!(
                "{}/transcribe?rate={}&partial={}",
                self.endpoint, self.sample_rate, partial
            ))
            .header("content-type", "application/octet-stream")
            .body(audio)
            .send()
            .await
            .map_err(|e| Error::Asr(format!("transcribe request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Asr(format!("transcribe returned {status}: {body}")));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Asr(format!("invalid transcribe response: {e}")))
    }
}

#[async_trait]
impl SpeechRecognizer for LocalRecognizer {
    async fn open_stream(&self, updates: mpsc::Sender<Transcript>) -> Result<Box<dyn AsrStream>> {
        Ok(Box::new(LocalAsrStream {
            recognizer: LocalRecognizer {
                client: self.client.clone(),
                endpoint: self.endpoint.clone(),
                sample_rate: self.sample_rate,
                partial_interval_bytes: self.partial_interval_bytes,
            },
            buffer: Vec::with_capacity(self.sample_rate as usize * 4),
            since_partial: 0,
            updates,
        }))
    }
}

struct LocalAsrStream {
    recognizer: LocalRecognizer,
    buffer: Vec<u8>,
    since_partial: usize,
    updates: mpsc::Sender<Transcript>,
}

#[async_trait]
impl AsrStream for LocalAsrStream {
    async fn send(&mut self, pcm16: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(pcm16);
        self.since_partial += pcm16.len();

        if self.since_partial < self.recognizer.partial_interval_bytes {
            return Ok(());
        }
        self.since_partial = 0;

        let response = self
            .recognizer
            .transcribe(self.buffer.clone(), true)
            .await?;
        if !response.text.is_empty()
            && self
                .updates
                .send(Transcript::partial(response.text, response.confidence))
                .await
                .is_err()
        {
            tracing::debug!("partial receiver dropped");
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<Transcript> {
        if self.buffer.is_empty() {
            return Ok(Transcript::final_result(String::new(), 0.0));
        }
        let response = self.recognizer.transcribe(self.buffer, false).await?;
        Ok(Transcript::final_result(response.text, response.confidence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callbridge_config::AsrProvider;

    #[test]
    fn test_constructs_from_config() {
        let config = AsrConfig {
            provider: AsrProvider::Local,
            endpoint: "http://127.0.0.1:8090".into(),
            sample_rate: 8000,
            ..Default::default()
        };
        let recognizer = LocalRecognizer::new(&config).unwrap();
        assert_eq!(recognizer.partial_interval_bytes, 16000);
    }
}
