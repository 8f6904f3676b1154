//! Local synthesis sidecar client
//!
//! Talks to a synthesis service running on this host (typically a
//! model server sidecar) and receives raw PCM16.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use callbridge_config::TtsConfig;
use callbridge_core::{Error, Result, SpeechSynthesizer};

/// Local sidecar synthesizer.
pub struct LocalSynthesizer {
    client: Client,
    endpoint: String,
    sample_rate: u32,
    voice: Option<String>,
}

impl LocalSynthesizer {
    pub fn new(config: &TtsConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            sample_rate: config.sample_rate,
            voice: config.voice.clone(),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for LocalSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let mut query: Vec<(&str, String)> = vec![("rate", self.sample_rate.to_string())];
        if let Some(voice) = &self.voice {
            query.push(("voice", voice.clone()));
        }

        let response = self
            .client
            .post(format!("{}/api/tts", self.endpoint))
            .query(&query)
            .header("content-type", "text/plain; charset=utf-8")
            .body(text.to_string())
            .send()
            .await
            .map_err(|e| Error::Tts(format!("tts request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("tts returned {status}: {body}")));
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
    use callbridge_config::TtsProvider;

    #[test]
    fn test_constructs_from_config() {
        let config = TtsConfig {
            provider: TtsProvider::Local,
            endpoint: "http://127.0.0.1:8091".into(),
            sample_rate: 16000,
            ..Default::default()
        };
        let synthesizer = LocalSynthesizer::new(&config).unwrap();
        assert_eq!(synthesizer.native_rate(), 16000);
    }
}
