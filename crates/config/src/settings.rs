//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Speech recognizer provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AsrProvider {
    /// Cloud streaming recognition service
    #[default]
    Cloud,
    /// Local recognition sidecar on this host
    Local,
}

/// Speech synthesizer provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TtsProvider {
    /// Cloud synthesis service
    #[default]
    Cloud,
    /// Local synthesis sidecar on this host
    Local,
}

/// Main application settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Speech recognition configuration
    #[serde(default)]
    pub asr: AsrConfig,

    /// Speech synthesis configuration
    #[serde(default)]
    pub tts: TtsConfig,

    /// Inference back-end configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// Voice activity detection tuning
    #[serde(default)]
    pub vad: VadSettings,

    /// Outbound audio pacing
    #[serde(default)]
    pub outbound: OutboundConfig,

    /// Dialogue behavior
    #[serde(default)]
    pub dialogue: DialogueConfig,

    /// Session registry limits
    #[serde(default)]
    pub session: SessionConfig,

    /// Diagnostic dumps
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port the provider media WebSocket listens on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

/// Speech recognition configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrConfig {
    /// Provider variant
    #[serde(default)]
    pub provider: AsrProvider,
    /// Service endpoint (cloud URL or local sidecar URL)
    #[serde(default = "default_asr_endpoint")]
    pub endpoint: String,
    /// API key for the cloud provider
    #[serde(default)]
    pub api_key: Option<String>,
    /// Sample rate the recognizer expects, in Hz
    #[serde(default = "default_asr_rate")]
    pub sample_rate: u32,
    /// Request timeout in ms
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_asr_endpoint() -> String {
    "http://127.0.0.1:8090".to_string()
}

fn default_asr_rate() -> u32 {
    16000
}

fn default_provider_timeout_ms() -> u64 {
    10_000
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            provider: AsrProvider::default(),
            endpoint: default_asr_endpoint(),
            api_key: None,
            sample_rate: default_asr_rate(),
            timeout_ms: default_provider_timeout_ms(),
        }
    }
}

/// Speech synthesis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Provider variant
    #[serde(default)]
    pub provider: TtsProvider,
    /// Service endpoint (cloud URL or local sidecar URL)
    #[serde(default = "default_tts_endpoint")]
    pub endpoint: String,
    /// API key for the cloud provider
    #[serde(default)]
    pub api_key: Option<String>,
    /// Sample rate the synthesizer produces, in Hz
    #[serde(default = "default_tts_rate")]
    pub sample_rate: u32,
    /// Voice identifier
    #[serde(default)]
    pub voice: Option<String>,
    /// Request timeout in ms
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_tts_endpoint() -> String {
    "http://127.0.0.1:8091".to_string()
}

fn default_tts_rate() -> u32 {
    24000
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: TtsProvider::default(),
            endpoint: default_tts_endpoint(),
            api_key: None,
            sample_rate: default_tts_rate(),
            voice: None,
            timeout_ms: default_provider_timeout_ms(),
        }
    }
}

/// Inference back-end configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the conversational inference API
    #[serde(default = "default_backend_url")]
    pub base_url: String,
    /// Maximum wait for the next streamed chunk, in ms
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Overall per-turn budget, in ms
    #[serde(default = "default_turn_timeout_ms")]
    pub turn_timeout_ms: u64,
}

fn default_backend_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_read_timeout_ms() -> u64 {
    30_000
}

fn default_turn_timeout_ms() -> u64 {
    80_000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
            read_timeout_ms: default_read_timeout_ms(),
            turn_timeout_ms: default_turn_timeout_ms(),
        }
    }
}

/// Voice activity detection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadSettings {
    /// Energy (dB RMS) above which a window counts as speech
    #[serde(default = "default_on_threshold_db")]
    pub on_threshold_db: f32,
    /// Energy (dB RMS) below which a window counts as silence.
    /// Must stay below `on_threshold_db`; the gap is the hysteresis.
    #[serde(default = "default_off_threshold_db")]
    pub off_threshold_db: f32,
    /// Consecutive speech needed to confirm an utterance start, in ms
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u32,
    /// Consecutive silence needed to end an utterance, in ms
    #[serde(default = "default_min_silence_ms")]
    pub min_silence_ms: u32,
    /// Inbound inactivity before a synthetic speech-ended nudge, in ms
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

fn default_on_threshold_db() -> f32 {
    -35.0
}

fn default_off_threshold_db() -> f32 {
    -45.0
}

fn default_min_speech_ms() -> u32 {
    120
}

fn default_min_silence_ms() -> u32 {
    600
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            on_threshold_db: default_on_threshold_db(),
            off_threshold_db: default_off_threshold_db(),
            min_speech_ms: default_min_speech_ms(),
            min_silence_ms: default_min_silence_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

/// Outbound audio pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    /// Mu-law bytes per outbound media segment (512 = ~64ms at 8kHz)
    #[serde(default = "default_segment_bytes")]
    pub segment_bytes: usize,
    /// How far ahead of real time each segment may be written, in ms
    #[serde(default = "default_pacing_slack_ms")]
    pub pacing_slack_ms: u64,
}

fn default_segment_bytes() -> usize {
    512
}

fn default_pacing_slack_ms() -> u64 {
    10
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            segment_bytes: default_segment_bytes(),
            pacing_slack_ms: default_pacing_slack_ms(),
        }
    }
}

/// Dialogue behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueConfig {
    /// Greeting spoken when a call starts
    #[serde(default = "default_greeting")]
    pub greeting: String,
}

fn default_greeting() -> String {
    "Hello! How can I help you today?".to_string()
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            greeting: default_greeting(),
        }
    }
}

/// Session registry limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum concurrent calls
    #[serde(default = "default_max_calls")]
    pub max_calls: usize,
    /// Idle seconds before an abandoned session is swept
    #[serde(default = "default_session_idle_secs")]
    pub idle_timeout_secs: u64,
}

fn default_max_calls() -> usize {
    100
}

fn default_session_idle_secs() -> u64 {
    300
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_calls: default_max_calls(),
            idle_timeout_secs: default_session_idle_secs(),
        }
    }
}

/// Diagnostic dumps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Dump inbound PCM to a per-call WAV file
    #[serde(default)]
    pub dump_inbound_wav: bool,
    /// Directory for diagnostic dumps
    #[serde(default = "default_dump_dir")]
    pub dump_dir: String,
}

fn default_dump_dir() -> String {
    "/tmp/callbridge".to_string()
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            dump_inbound_wav: false,
            dump_dir: default_dump_dir(),
        }
    }
}

impl Settings {
    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vad.off_threshold_db >= self.vad.on_threshold_db {
            return Err(ConfigError::Invalid(format!(
                "vad.off_threshold_db ({}) must be below vad.on_threshold_db ({})",
                self.vad.off_threshold_db, self.vad.on_threshold_db
            )));
        }
        if self.outbound.segment_bytes == 0 {
            return Err(ConfigError::Invalid(
                "outbound.segment_bytes must be non-zero".to_string(),
            ));
        }
        if self.backend.read_timeout_ms > self.backend.turn_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "backend.read_timeout_ms ({}) exceeds backend.turn_timeout_ms ({})",
                self.backend.read_timeout_ms, self.backend.turn_timeout_ms
            )));
        }
        Ok(())
    }
}

/// Load settings with the usual layering:
/// 1. Environment variables (CALLBRIDGE_ prefix, `__` separator)
/// 2. Optional config/default file
/// 3. Struct defaults
pub fn load_settings() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("CALLBRIDGE")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.vad.min_speech_ms, 120);
        assert_eq!(settings.vad.min_silence_ms, 600);
        assert_eq!(settings.outbound.segment_bytes, 512);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_hysteresis_validation() {
        let mut settings = Settings::default();
        settings.vad.off_threshold_db = settings.vad.on_threshold_db;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_timeout_validation() {
        let mut settings = Settings::default();
        settings.backend.read_timeout_ms = settings.backend.turn_timeout_ms + 1;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_provider_enum_parsing() {
        let asr: AsrProvider = serde_json::from_str("\"local\"").unwrap();
        assert_eq!(asr, AsrProvider::Local);
        let tts: TtsProvider = serde_json::from_str("\"cloud\"").unwrap();
        assert_eq!(tts, TtsProvider::Cloud);
    }
}
