//! Shared application state
//!
//! All provider collaborators are injected here at startup and handed
//! to each call session; nothing is global.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use callbridge_config::Settings;
use callbridge_core::{InferenceClient, SpeechRecognizer, SpeechSynthesizer};

use crate::session::SessionRegistry;

/// Application state shared across HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub backend: Arc<dyn InferenceClient>,
    pub registry: Arc<SessionRegistry>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        settings: Settings,
        recognizer: Arc<dyn SpeechRecognizer>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        backend: Arc<dyn InferenceClient>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(&settings.session));
        Self {
            settings: Arc::new(settings),
            recognizer,
            synthesizer,
            backend,
            registry,
            metrics,
        }
    }
}
