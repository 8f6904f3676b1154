//! Provider-facing runtime for the call mediation engine
//!
//! Owns the media WebSocket endpoint, the per-call task supervision,
//! the call session registry, and the small HTTP surface around them.

pub mod diagnostics;
pub mod http;
pub mod metrics;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod state;

pub use http::create_router;
pub use metrics::init_metrics;
pub use session::{CallSession, SessionRegistry};
pub use state::AppState;

use thiserror::Error;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("at capacity ({0} concurrent calls)")]
    Capacity(usize),

    #[error("session error: {0}")]
    Session(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}
