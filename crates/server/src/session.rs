//! Call session registry
//!
//! Tracks live calls keyed by the provider stream id, enforces the
//! concurrent-call cap, and sweeps sessions abandoned without a stop
//! event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::watch;

use callbridge_config::SessionConfig;
use callbridge_core::{CallPhase, CancelToken};

use crate::ServerError;

/// One live phone call.
pub struct CallSession {
    /// Provider-assigned stream id
    pub stream_sid: String,
    /// Provider call id, used as the back-end conversation id
    pub call_sid: String,
    /// Caller phone number when known
    pub caller: Option<String>,
    /// Session start
    pub started_at: Instant,
    last_activity: RwLock<Instant>,
    phase: watch::Receiver<CallPhase>,
    cancel: CancelToken,
}

impl CallSession {
    pub fn new(
        stream_sid: impl Into<String>,
        call_sid: impl Into<String>,
        caller: Option<String>,
        phase: watch::Receiver<CallPhase>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            stream_sid: stream_sid.into(),
            call_sid: call_sid.into(),
            caller,
            started_at: Instant::now(),
            last_activity: RwLock::new(Instant::now()),
            phase,
            cancel,
        }
    }

    /// Update last activity.
    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Check if the session has seen no traffic for `timeout`.
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_activity.read().elapsed() > timeout
    }

    /// Current call phase.
    pub fn phase(&self) -> CallPhase {
        *self.phase.borrow()
    }

    /// Request teardown of this call's task tree.
    pub fn hangup(&self) {
        self.cancel.cancel();
    }

    /// Whether teardown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Registry of live calls.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<CallSession>>>,
    max_calls: usize,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_calls: config.max_calls,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        }
    }

    /// Register a new call, enforcing the capacity cap.
    pub fn insert(&self, session: Arc<CallSession>) -> Result<(), ServerError> {
        let mut sessions = self.sessions.write();

        if sessions.len() >= self.max_calls {
            self.cleanup_expired_internal(&mut sessions);
            if sessions.len() >= self.max_calls {
                return Err(ServerError::Capacity(self.max_calls));
            }
        }

        tracing::info!(
            stream_sid = %session.stream_sid,
            call_sid = %session.call_sid,
            live = sessions.len() + 1,
            "call registered"
        );
        sessions.insert(session.stream_sid.clone(), session);
        Ok(())
    }

    pub fn get(&self, stream_sid: &str) -> Option<Arc<CallSession>> {
        self.sessions.read().get(stream_sid).cloned()
    }

    pub fn remove(&self, stream_sid: &str) {
        if let Some(session) = self.sessions.write().remove(stream_sid) {
            session.hangup();
            tracing::info!(stream_sid = %stream_sid, "call removed");
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Sweep sessions that stopped receiving traffic without a stop
    /// event (e.g. the provider vanished mid-call).
    pub fn cleanup_expired(&self) {
        let mut sessions = self.sessions.write();
        self.cleanup_expired_internal(&mut sessions);
    }

    fn cleanup_expired_internal(&self, sessions: &mut HashMap<String, Arc<CallSession>>) {
        let timeout = self.idle_timeout;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.is_expired(timeout))
            .map(|(sid, _)| sid.clone())
            .collect();

        for sid in expired {
            if let Some(session) = sessions.remove(&sid) {
                session.hangup();
                tracing::info!(stream_sid = %sid, "expired call swept");
            }
        }
    }

    /// Start the periodic sweep task. The returned sender stops the
    /// task when sent `true`; keep it alive for the process lifetime.
    pub fn start_sweep_task(self: &Arc<Self>) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let before = registry.count();
                        registry.cleanup_expired();
                        let after = registry.count();
                        if before != after {
                            tracing::info!(swept = before - after, live = after, "session sweep");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            tracing::debug!("session sweep task stopping");
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }
}
