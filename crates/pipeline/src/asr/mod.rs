//! Streaming speech recognition providers
//!
//! Two concrete variants behind the [`SpeechRecognizer`] capability
//! set: a cloud streaming service and a local sidecar on this host.
//! Selection is configuration-driven; the rest of the engine only sees
//! the trait.

mod cloud;
mod local;

pub use cloud::CloudRecognizer;
pub use local::LocalRecognizer;

use std::sync::Arc;

use callbridge_config::{AsrConfig, AsrProvider};
use callbridge_core::{Result, SpeechRecognizer};

/// Build the configured recognizer variant.
pub fn create_recognizer(config: &AsrConfig) -> Result<Arc<dyn SpeechRecognizer>> {
    match config.provider {
        AsrProvider::Cloud => Ok(Arc::new(CloudRecognizer::new(config)?)),
        AsrProvider::Local => Ok(Arc::new(LocalRecognizer::new(config)?)),
    }
}
