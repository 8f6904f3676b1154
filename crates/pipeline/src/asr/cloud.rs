//! Cloud streaming recognizer
//!
//! Incremental-HTTP client for a hosted recognition API: audio is
//! accumulated per utterance and posted with `partial: true` at a fixed
//! cadence for interim hypotheses; closing the stream posts the full
//! utterance for the final transcript. The service may finalize early
//! by answering a partial request with `is_final: true`.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use callbridge_config::AsrConfig;
use callbridge_core::{AsrStream, Error, Result, SpeechRecognizer, Transcript};

/// Cloud recognizer over HTTP.
pub struct CloudRecognizer {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    sample_rate: u32,
    /// PCM bytes between partial-recognition requests (~1s of audio).
    partial_interval_bytes: usize,
}

#[derive(Serialize)]
struct RecognizeRequest<'a> {
    audio: String,
    sample_rate: u32,
    encoding: &'a str,
    partial: bool,
}

#[derive(Deserialize)]
struct RecognizeResponse {
    text: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    is_final: bool,
}

impl CloudRecognizer {
    pub fn new(config: &AsrConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            sample_rate: config.sample_rate,
            partial_interval_bytes: config.sample_rate as usize * 2,
        })
    }

    async fn recognize(&self, audio: &[u8], partial: bool) -> Result<RecognizeResponse> {
        let request = RecognizeRequest {
            audio: BASE64.encode(audio),
            sample_rate: self.sample_rate,
            encoding: "pcm16",
            partial,
        };

        let mut builder = self
            .client
            .post(format!("{}/v1/recognize", self.endpoint))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Asr(format!("recognize request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Asr(format!("recognize returned {status}: {body}")));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Asr(format!("invalid recognize response: {e}")))
    }
}

#[async_trait]
impl SpeechRecognizer for CloudRecognizer {
    async fn open_stream(&self, updates: mpsc::Sender<Transcript>) -> Result<Box<dyn AsrStream>> {
        Ok(Box::new(CloudAsrStream {
            recognizer: self.clone_parts(),
            buffer: Vec::with_capacity(self.sample_rate as usize * 4),
            since_partial: 0,
            updates,
        }))
    }
}

impl CloudRecognizer {
    fn clone_parts(&self) -> CloudRecognizer {
        CloudRecognizer {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            api_key: self.api_key.clone(),
            sample_rate: self.sample_rate,
            partial_interval_bytes: self.partial_interval_bytes,
        }
    }
}

struct CloudAsrStream {
    recognizer: CloudRecognizer,
    buffer: Vec<u8>,
    since_partial: usize,
    updates: mpsc::Sender<Transcript>,
}

#[async_trait]
impl AsrStream for CloudAsrStream {
    async fn send(&mut self, pcm16: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(pcm16);
        self.since_partial += pcm16.len();

        if self.since_partial < self.recognizer.partial_interval_bytes {
            return Ok(());
        }
        self.since_partial = 0;

        let response = self.recognizer.recognize(&self.buffer, true).await?;
        if response.text.is_empty() {
            return Ok(());
        }

        let transcript = if response.is_final {
            Transcript::final_result(response.text, response.confidence)
        } else {
            Transcript::partial(response.text, response.confidence)
        };
        if self.updates.send(transcript).await.is_err() {
            tracing::debug!("partial receiver dropped");
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<Transcript> {
        if self.buffer.is_empty() {
            return Ok(Transcript::final_result(String::new(), 0.0));
        }
        let response = self.recognizer.recognize(&self.buffer, false).await?;
        Ok(Transcript::final_result(response.text, response.confidence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructs_from_config() {
        let config = AsrConfig {
            endpoint: "https://asr.example.com/".into(),
            api_key: Some("key".into()),
            ..Default::default()
        };
        let recognizer = CloudRecognizer::new(&config).unwrap();
        assert_eq!(recognizer.endpoint, "https://asr.example.com");
        assert_eq!(recognizer.partial_interval_bytes, 32000);
    }
}
