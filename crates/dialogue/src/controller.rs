//! Dialogue controller
//!
//! Runs the per-turn state machine for one call and owns the barge-in
//! decision:
//!
//! ```text
//!   listening ──final(non-empty)──────────────► thinking
//!   thinking  ──first fragment enqueued───────► speaking
//!   speaking  ──reply finished + queue drained► listening
//!   {thinking, speaking} ──speech-started─────► listening  (interrupt)
//!   any       ──hangup────────────────────────► ended
//! ```
//!
//! The controller is the only mutator of conversation history and of
//! the call phase. Back-end replies are streamed by a per-turn task
//! that re-slices tokens at sentence boundaries (the text queue's
//! splitter is authoritative) and feeds the outbound pipeline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use callbridge_config::{BackendConfig, DialogueConfig};
use callbridge_core::{
    CallPhase, CancelToken, ConversationHistory, ConversationTurn, InferenceClient,
    UtteranceEvent, UtteranceKind,
};
use callbridge_pipeline::{split_boundary, SenderEvent, SenderHandle, TextQueue};

/// Spoken when the back end times out or breaks mid-reply.
pub const FALLBACK_SENTENCE: &str = "I'm sorry, could you repeat your question?";

/// Spoken after prolonged caller silence.
pub const NUDGE_SENTENCE: &str = "Are you still there?";

/// How long the controller waits for the sender to abandon its
/// in-flight segment group during interruption.
const INTERRUPT_SETTLE_TIMEOUT: Duration = Duration::from_millis(200);

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Maximum wait for the next streamed back-end chunk
    pub read_timeout: Duration,
    /// Overall per-turn budget
    pub turn_timeout: Duration,
    /// Greeting spoken when the call starts (empty disables)
    pub greeting: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            turn_timeout: Duration::from_secs(80),
            greeting: String::new(),
        }
    }
}

impl ControllerConfig {
    pub fn from_settings(backend: &BackendConfig, dialogue: &DialogueConfig) -> Self {
        Self {
            read_timeout: Duration::from_millis(backend.read_timeout_ms),
            turn_timeout: Duration::from_millis(backend.turn_timeout_ms),
            greeting: dialogue.greeting.clone(),
        }
    }
}

/// Bookkeeping for one in-flight back-end request.
struct PendingReply {
    request_id: Uuid,
    cancel: CancelToken,
    task: JoinHandle<()>,
}

/// The caller turn currently being answered.
struct TurnContext {
    user_text: String,
    started_at_ms: u64,
    started: Instant,
}

/// Outcome reported by a reply-streamer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnSignal {
    /// The back-end stream completed and the queue holds the full reply.
    Completed { request_id: Uuid },
    /// The back end timed out or broke; the fallback sentence is queued.
    Fallback { request_id: Uuid },
}

/// Per-call dialogue controller task.
pub struct DialogueController {
    config: ControllerConfig,
    conversation_id: String,
    backend: Arc<dyn InferenceClient>,
    queue: Arc<TextQueue>,
    sender: SenderHandle,
    sender_events: mpsc::Receiver<SenderEvent>,
    utterances: mpsc::Receiver<UtteranceEvent>,
    phase: Arc<watch::Sender<CallPhase>>,
    cancel: CancelToken,
    history: ConversationHistory,
    pending: Option<PendingReply>,
    current_turn: Option<TurnContext>,
    turn_signals_tx: mpsc::Sender<TurnSignal>,
    turn_signals_rx: mpsc::Receiver<TurnSignal>,
}

impl DialogueController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ControllerConfig,
        conversation_id: impl Into<String>,
        backend: Arc<dyn InferenceClient>,
        queue: Arc<TextQueue>,
        sender: SenderHandle,
        sender_events: mpsc::Receiver<SenderEvent>,
        utterances: mpsc::Receiver<UtteranceEvent>,
        phase: Arc<watch::Sender<CallPhase>>,
        cancel: CancelToken,
    ) -> Self {
        let (turn_signals_tx, turn_signals_rx) = mpsc::channel(8);
        Self {
            config,
            conversation_id: conversation_id.into(),
            backend,
            queue,
            sender,
            sender_events,
            utterances,
            phase,
            cancel,
            history: ConversationHistory::new(),
            pending: None,
            current_turn: None,
            turn_signals_tx,
            turn_signals_rx,
        }
    }

    /// Run until the utterance stream closes or the session is
    /// cancelled.
    pub async fn run(mut self) {
        self.set_phase(CallPhase::Listening);
        let greeting = self.config.greeting.clone();
        self.speak_system(&greeting).await;

        let mut sender_done = false;
        loop {
            tokio::select! {
                maybe_event = self.utterances.recv() => match maybe_event {
                    Some(event) => self.on_utterance_event(event).await,
                    None => break,
                },
                maybe_signal = self.turn_signals_rx.recv() => {
                    if let Some(signal) = maybe_signal {
                        self.on_turn_signal(signal);
                    }
                }
                maybe_sender = self.sender_events.recv(), if !sender_done => {
                    match maybe_sender {
                        Some(SenderEvent::ReplyFinished { reply }) => {
                            self.on_reply_finished(reply)
                        }
                        // Sender gone (teardown or fatal); stop polling
                        // the closed channel.
                        None => sender_done = true,
                    }
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }
        }

        self.teardown();
    }

    /// Conversation history accumulated so far (used at teardown).
    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    async fn on_utterance_event(&mut self, event: UtteranceEvent) {
        match event.kind {
            UtteranceKind::SpeechStarted => self.on_speech_started().await,
            UtteranceKind::Partial => {
                tracing::trace!(text = %event.text, "partial transcript");
            }
            UtteranceKind::Final => {
                if event.text.trim().is_empty() {
                    tracing::debug!("empty final transcript, staying in listening");
                    return;
                }
                self.start_turn(event).await;
            }
            UtteranceKind::SpeechEnded => {
                // Identical offsets mark the synthetic event the inbound
                // pipeline emits after prolonged inactivity.
                let synthetic = event.start_ms == event.end_ms;
                if synthetic
                    && self.phase() == CallPhase::Listening
                    && self.pending.is_none()
                    && !self.sender.is_transmitting()
                {
                    self.nudge().await;
                }
            }
        }
    }

    async fn on_speech_started(&mut self) {
        match self.phase() {
            CallPhase::Thinking => {
                // The caller has more to say; drop the in-flight answer.
                self.interrupt("caller resumed while thinking").await;
            }
            CallPhase::Speaking => {
                if self.queue.holds_speech() || self.sender.is_transmitting() {
                    self.interrupt("barge-in during reply").await;
                } else {
                    tracing::debug!("speech-started with drained queue, treating as noise");
                }
            }
            _ => {}
        }
    }

    /// Caller utterance finalized: issue a back-end request. The
    /// caller's latest words always win over an in-flight reply.
    async fn start_turn(&mut self, event: UtteranceEvent) {
        if self.pending.is_some() {
            self.interrupt("superseded by newer utterance").await;
        }
        if self.current_turn.is_some() {
            // A reply finished streaming but its tail audio never
            // drained before the caller went on; bank what was spoken.
            let spoken = self.sender.take_spoken();
            self.record_turn(spoken, false);
        }

        tracing::info!(
            text = %event.text,
            confidence = event.confidence,
            "caller turn finalized"
        );
        metrics::counter!("callbridge_turns_total").increment(1);

        self.current_turn = Some(TurnContext {
            user_text: event.text.clone(),
            started_at_ms: event.end_ms,
            started: Instant::now(),
        });
        self.set_phase(CallPhase::Thinking);

        let request_id = Uuid::new_v4();
        let cancel = self.cancel.child();
        let task = tokio::spawn(stream_reply(
            self.backend.clone(),
            self.queue.clone(),
            self.phase.clone(),
            self.conversation_id.clone(),
            event.text,
            self.history.turns().to_vec(),
            self.config.clone(),
            cancel.clone(),
            self.turn_signals_tx.clone(),
            request_id,
        ));

        self.pending = Some(PendingReply {
            request_id,
            cancel,
            task,
        });
    }

    /// Interruption protocol. Idempotent: a second application finds
    /// nothing left to cancel, flush, or record.
    async fn interrupt(&mut self, reason: &str) {
        tracing::info!(reason, "interrupting");
        metrics::counter!("callbridge_interruptions_total").increment(1);

        // 1. Cancel the in-flight back-end reply. The streamer observes
        //    the token between chunks; nothing is killed forcefully.
        if let Some(pending) = self.pending.take() {
            pending.cancel.cancel();
            drop(pending.task);
        }

        // 2. Flush queued, unspoken text.
        self.queue.flush();

        // 3. Stop the sender at its next segment boundary, then give it
        //    a moment to record what actually went out.
        if self.sender.is_transmitting() {
            self.sender.interrupt();
            let deadline = Instant::now() + INTERRUPT_SETTLE_TIMEOUT;
            while self.sender.is_transmitting() && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        // 4. The partially spoken reply becomes the system turn.
        let spoken = self.sender.take_spoken();
        self.record_turn(spoken.clone(), true);
        if !spoken.is_empty() {
            self.log_external(spoken);
        }

        // 5. Back to listening.
        self.set_phase(CallPhase::Listening);
    }

    fn on_turn_signal(&mut self, signal: TurnSignal) {
        let (TurnSignal::Completed { request_id } | TurnSignal::Fallback { request_id }) = signal;

        match &self.pending {
            Some(pending) if pending.request_id == request_id => {
                if matches!(signal, TurnSignal::Fallback { .. }) {
                    metrics::counter!("callbridge_fallbacks_total").increment(1);
                    self.log_external(FALLBACK_SENTENCE.to_string());
                }
                self.pending = None;
            }
            _ => {
                tracing::debug!(%request_id, "stale turn signal ignored");
                return;
            }
        }

        // A reply that produced no speakable text never moves the call
        // to speaking; close the turn here instead of waiting for a
        // sender event that cannot carry it.
        if self.phase() == CallPhase::Thinking
            && !self.sender.is_transmitting()
            && self.queue.pending_chars() == 0
        {
            let spoken = self.sender.take_spoken();
            self.record_turn(spoken, false);
            self.set_phase(CallPhase::Listening);
        }
    }

    /// The sender drained a whole reply and sent its mark.
    fn on_reply_finished(&mut self, reply: u64) {
        let spoken = self.sender.take_spoken();
        if self.phase() != CallPhase::Speaking {
            tracing::debug!(reply, "reply finished outside speaking, ignored");
            return;
        }
        tracing::debug!(reply, spoken_chars = spoken.len(), "reply finished");
        self.record_turn(spoken, false);
        self.set_phase(CallPhase::Listening);
    }

    fn record_turn(&mut self, spoken: String, interrupted: bool) {
        let Some(context) = self.current_turn.take() else {
            return;
        };
        let elapsed_ms = context.started.elapsed().as_millis() as u64;
        metrics::histogram!("callbridge_turn_latency_ms").record(elapsed_ms as f64);

        self.history.push(ConversationTurn {
            user_text: context.user_text,
            reply_text: spoken,
            started_at_ms: context.started_at_ms,
            elapsed_ms,
            interrupted,
        });
    }

    /// Speak system-originated text (greeting, nudge) and log it to
    /// the back-end conversation.
    async fn speak_system(&mut self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        self.queue.enqueue_text(text);
        self.queue.finish_reply();
        self.set_phase(CallPhase::Speaking);
        self.log_external(text.to_string());
    }

    async fn nudge(&mut self) {
        tracing::info!("caller idle, nudging");
        self.speak_system(NUDGE_SENTENCE).await;
    }

    fn log_external(&self, text: String) {
        let backend = self.backend.clone();
        let conversation_id = self.conversation_id.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.add_external_message(&conversation_id, &text).await {
                tracing::warn!(error = %e, "failed to log external message");
            }
        });
    }

    fn teardown(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel.cancel();
        }
        self.queue.flush();
        self.queue.close();
        if self.sender.is_transmitting() {
            self.sender.interrupt();
        }
        self.set_phase(CallPhase::Ended);
        tracing::info!(
            conversation_id = %self.conversation_id,
            turns = self.history.turn_count(),
            "dialogue controller stopped"
        );
    }

    fn phase(&self) -> CallPhase {
        *self.phase.borrow()
    }

    fn set_phase(&self, phase: CallPhase) {
        let previous = self.phase();
        if previous != phase {
            tracing::debug!(from = %previous, to = %phase, "phase transition");
            let _ = self.phase.send(phase);
        }
    }
}

/// Per-turn reply streamer.
///
/// Reads the back-end token stream until completion, cancellation, or
/// timeout, re-slicing into sentence-ish fragments with the text
/// queue's splitter. The first enqueued fragment moves the call to
/// `speaking`.
#[allow(clippy::too_many_arguments)]
async fn stream_reply(
    backend: Arc<dyn InferenceClient>,
    queue: Arc<TextQueue>,
    phase: Arc<watch::Sender<CallPhase>>,
    conversation_id: String,
    user_text: String,
    history: Vec<ConversationTurn>,
    config: ControllerConfig,
    cancel: CancelToken,
    signals: mpsc::Sender<TurnSignal>,
    request_id: Uuid,
) {
    let deadline = Instant::now() + config.turn_timeout;

    let mut rx = match backend
        .stream_ask(&conversation_id, &user_text, &history, cancel.clone())
        .await
    {
        Ok(rx) => rx,
        Err(e) => {
            tracing::warn!(error = %e, "ask request failed");
            speak_fallback(&queue, &phase, &signals, request_id).await;
            return;
        }
    };

    let mut buffer = String::new();
    let mut spoke = false;

    loop {
        if cancel.is_cancelled() {
            tracing::debug!(%request_id, "reply cancelled");
            return;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::warn!(%request_id, "turn budget exhausted");
            speak_fallback(&queue, &phase, &signals, request_id).await;
            return;
        }
        let wait = config.read_timeout.min(remaining);

        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(Ok(chunk))) => {
                buffer.push_str(&chunk);
                while let Some(boundary) = split_boundary(&buffer) {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let fragment: String = buffer.drain(..boundary).collect();
                    enqueue_fragment(&queue, &phase, &fragment, &mut spoke);
                }
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(error = %e, %request_id, "reply stream broke");
                speak_fallback(&queue, &phase, &signals, request_id).await;
                return;
            }
            Ok(None) => {
                if cancel.is_cancelled() {
                    return;
                }
                let tail = std::mem::take(&mut buffer);
                if !tail.trim().is_empty() {
                    enqueue_fragment(&queue, &phase, &tail, &mut spoke);
                }
                queue.finish_reply();
                let _ = signals.send(TurnSignal::Completed { request_id }).await;
                return;
            }
            Err(_) => {
                tracing::warn!(
                    %request_id,
                    timeout_ms = wait.as_millis() as u64,
                    "no back-end chunk within read timeout"
                );
                speak_fallback(&queue, &phase, &signals, request_id).await;
                return;
            }
        }
    }
}

fn enqueue_fragment(
    queue: &TextQueue,
    phase: &watch::Sender<CallPhase>,
    fragment: &str,
    spoke: &mut bool,
) {
    let trimmed = fragment.trim();
    if trimmed.is_empty() {
        return;
    }
    // Trailing space keeps adjacent fragments from fusing words when
    // the queue re-splits the buffer.
    if queue.enqueue_text(&format!("{trimmed} ")) && !*spoke {
        *spoke = true;
        if *phase.borrow() == CallPhase::Thinking {
            let _ = phase.send(CallPhase::Speaking);
        }
    }
}

async fn speak_fallback(
    queue: &TextQueue,
    phase: &watch::Sender<CallPhase>,
    signals: &mpsc::Sender<TurnSignal>,
    request_id: Uuid,
) {
    queue.flush();
    queue.enqueue_text(FALLBACK_SENTENCE);
    queue.finish_reply();
    if *phase.borrow() == CallPhase::Thinking {
        let _ = phase.send(CallPhase::Speaking);
    }
    let _ = signals.send(TurnSignal::Fallback { request_id }).await;
}
