//! Cloud synthesis client
//!
//! Posts text to a hosted synthesis API and receives raw PCM16 at the
//! configured sample rate.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use callbridge_config::TtsConfig;
use callbridge_core::{Error, Result, SpeechSynthesizer};

/// Cloud synthesizer over HTTP.
pub struct CloudSynthesizer {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    sample_rate: u32,
    voice: Option<String>,
}

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    sample_rate: u32,
    format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
}

impl CloudSynthesizer {
    pub fn new(config: &TtsConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            sample_rate: config.sample_rate,
            voice: config.voice.clone(),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for CloudSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let request = SynthesizeRequest {
            text,
            sample_rate: self.sample_rate,
            format: "pcm16",
            voice: self.voice.as_deref(),
        };

        let mut builder = self
            .client
            .post(format!("{}/v1/synthesize", self.endpoint))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Tts(format!("synthesize request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("synthesize returned {status}: {body}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Tts(format!("failed to read audio body: {e}")))?;
        Ok(bytes.to_vec())
    }

    fn native_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructs_from_config() {
        let config = TtsConfig {
            endpoint: "https://tts.example.com/".into(),
            api_key: Some("key".into()),
            sample_rate: 24000,
            voice: Some("aria".into()),
            ..Default::default()
        };
        let synthesizer = CloudSynthesizer::new(&config).unwrap();
        assert_eq!(synthesizer.native_rate(), 24000);
        assert_eq!(synthesizer.endpoint, "https://tts.example.com");
    }
}
