//! Entry point

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use callbridge_config::{load_settings, Settings};
use callbridge_dialogue::RagClient;
use callbridge_pipeline::{asr, tts};
use callbridge_server::{create_router, init_metrics, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = match load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            // Tracing not yet initialized, use eprintln for early logging.
            eprintln!("warning: failed to load config: {e}; using defaults");
            Settings::default()
        }
    };

    init_tracing();
    tracing::info!("starting callbridge v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        asr = ?settings.asr.provider,
        tts = ?settings.tts.provider,
        backend = %settings.backend.base_url,
        "configuration loaded"
    );

    let metrics = init_metrics();

    let recognizer = asr::create_recognizer(&settings.asr)?;
    let synthesizer = tts::create_synthesizer(&settings.tts)?;
    let backend = Arc::new(RagClient::new(&settings.backend)?);

    let state = AppState::new(settings.clone(), recognizer, synthesizer, backend, metrics);
    // Keep the shutdown handle alive for the process lifetime.
    let _sweep = state.registry.start_sweep_task();

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "provider media WebSocket listening on /ws");

    axum::serve(listener, create_router(state)).await?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .init();
}
