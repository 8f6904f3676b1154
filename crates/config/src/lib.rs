//! Configuration for the call mediation engine
//!
//! All tunables come from one environment-driven bag:
//! - Environment variables with the `CALLBRIDGE_` prefix and `__`
//!   section separator (e.g. `CALLBRIDGE_VAD__MIN_SPEECH_MS=120`)
//! - An optional `config/default` file
//! - Struct defaults
//!
//! The engine itself never reads the environment; it receives a
//! [`Settings`] value at construction.

pub mod settings;

pub use settings::{
    load_settings, AsrConfig, AsrProvider, BackendConfig, DiagnosticsConfig, DialogueConfig,
    OutboundConfig, ServerConfig, SessionConfig, Settings, TtsConfig, TtsProvider, VadSettings,
};

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
