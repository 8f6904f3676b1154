//! Speech synthesis providers
//!
//! Two concrete variants behind the [`SpeechSynthesizer`] capability
//! set `{synthesize}`: a cloud synthesis API and a local sidecar.
//! Selection is configuration-driven.

mod cloud;
mod local;

pub use cloud::CloudSynthesizer;
pub use local::LocalSynthesizer;

use std::sync::Arc;

use callbridge_config::{TtsConfig, TtsProvider};
use callbridge_core::{Result, SpeechSynthesizer};

/// Build the configured synthesizer variant.
pub fn create_synthesizer(config: &TtsConfig) -> Result<Arc<dyn SpeechSynthesizer>> {
    match config.provider {
        TtsProvider::Cloud => Ok(Arc::new(CloudSynthesizer::new(config)?)),
        TtsProvider::Local => Ok(Arc::new(LocalSynthesizer::new(config)?)),
    }
}
