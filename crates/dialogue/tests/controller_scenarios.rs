//! End-to-end dialogue scenarios
//!
//! Wires a real text queue and speech sender (fake synthesizer, fake
//! sink) to the dialogue controller against a scripted back end, and
//! drives the turn state machine with injected utterance events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use callbridge_core::{
    CallPhase, CancelToken, ConversationTurn, Error, InferenceClient, OutboundSink, Result,
    SpeechSynthesizer, UtteranceEvent,
};
use callbridge_dialogue::{ControllerConfig, DialogueController, FALLBACK_SENTENCE};
use callbridge_pipeline::{SenderConfig, SpeechSender, TextQueue};

/// Scripted inference back end.
struct FakeBackend {
    reply: String,
    /// Never yield the first chunk when set.
    stall: bool,
    asks: Arc<Mutex<usize>>,
    captured_cancel: Arc<Mutex<Option<CancelToken>>>,
    logged: Arc<Mutex<Vec<String>>>,
}

impl FakeBackend {
    fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            stall: false,
            asks: Arc::new(Mutex::new(0)),
            captured_cancel: Arc::new(Mutex::new(None)),
            logged: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn stalled() -> Self {
        Self {
            stall: true,
            ..Self::new("")
        }
    }
}

#[async_trait]
impl InferenceClient for FakeBackend {
    async fn stream_ask(
        &self,
        _conversation_id: &str,
        _user_text: &str,
        _history: &[ConversationTurn],
        cancel: CancelToken,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        *self.asks.lock() += 1;
        *self.captured_cancel.lock() = Some(cancel.clone());

        let (tx, rx) = mpsc::channel(8);
        let reply = self.reply.clone();
        let stall = self.stall;
        tokio::spawn(async move {
            if stall {
                tokio::time::sleep(Duration::from_secs(1000)).await;
                return;
            }
            // Small leading delay keeps the thinking phase observable.
            tokio::time::sleep(Duration::from_millis(20)).await;
            for word in reply.split_inclusive(' ') {
                if cancel.is_cancelled() {
                    return;
                }
                if tx.send(Ok(word.to_string())).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        Ok(rx)
    }

    async fn add_external_message(&self, _conversation_id: &str, text: &str) -> Result<()> {
        self.logged.lock().push(text.to_string());
        Ok(())
    }
}

/// Synthesizer producing 10ms of audio per character at 8kHz.
struct FakeTts;

#[async_trait]
impl SpeechSynthesizer for FakeTts {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let samples = text.chars().count() * 80;
        let mut pcm = Vec::with_capacity(samples * 2);
        for i in 0..samples {
            pcm.extend_from_slice(&((i % 64) as i16 * 16).to_le_bytes());
        }
        Ok(pcm)
    }

    fn native_rate(&self) -> u32 {
        8000
    }
}

#[derive(Default)]
struct RecordingSink {
    media: Mutex<Vec<String>>,
    marks: Mutex<Vec<String>>,
    closed: AtomicBool,
}

#[async_trait]
impl OutboundSink for RecordingSink {
    async fn send_media(&self, payload_b64: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::WebSocket("closed".into()));
        }
        self.media.lock().push(payload_b64.to_string());
        Ok(())
    }

    async fn send_mark(&self, name: &str) -> Result<()> {
        self.marks.lock().push(name.to_string());
        Ok(())
    }
}

struct Harness {
    utterances: mpsc::Sender<UtteranceEvent>,
    phase: watch::Receiver<CallPhase>,
    queue: Arc<TextQueue>,
    sink: Arc<RecordingSink>,
    asks: Arc<Mutex<usize>>,
    captured_cancel: Arc<Mutex<Option<CancelToken>>>,
    logged: Arc<Mutex<Vec<String>>>,
    cancel: CancelToken,
    controller_task: JoinHandle<()>,
    sender_task: JoinHandle<Result<()>>,
}

fn spawn_harness(backend: FakeBackend, config: ControllerConfig) -> Harness {
    let asks = backend.asks.clone();
    let captured_cancel = backend.captured_cancel.clone();
    let logged = backend.logged.clone();

    let queue = Arc::new(TextQueue::new());
    let sink = Arc::new(RecordingSink::default());
    let (sender_events_tx, sender_events_rx) = mpsc::channel(8);
    let (sender, handle) = SpeechSender::new(
        SenderConfig {
            segment_bytes: 512,
            pacing_slack: Duration::from_millis(10),
            native_rate: 8000,
        },
        queue.clone(),
        Arc::new(FakeTts),
        sink.clone(),
        sender_events_tx,
    );
    let sender_task = tokio::spawn(sender.run());

    let (utterance_tx, utterance_rx) = mpsc::channel(64);
    let (phase_tx, phase_rx) = watch::channel(CallPhase::Starting);
    let cancel = CancelToken::new();

    let controller = DialogueController::new(
        config,
        "conv-test",
        Arc::new(backend),
        queue.clone(),
        handle,
        sender_events_rx,
        utterance_rx,
        Arc::new(phase_tx),
        cancel.clone(),
    );
    let controller_task = tokio::spawn(controller.run());

    Harness {
        utterances: utterance_tx,
        phase: phase_rx,
        queue,
        sink,
        asks,
        captured_cancel,
        logged,
        cancel,
        controller_task,
        sender_task,
    }
}

async fn wait_for_phase(harness: &mut Harness, phase: CallPhase) {
    tokio::time::timeout(
        Duration::from_secs(120),
        harness.phase.wait_for(|p| *p == phase),
    )
    .await
    .unwrap_or_else(|_| panic!("never reached phase {phase}"))
    .unwrap();
}

fn final_event(text: &str) -> UtteranceEvent {
    UtteranceEvent::final_transcript(text, 0.9, 1000, 2000)
}

#[tokio::test(start_paused = true)]
async fn test_happy_path_short_turn() {
    let reply = "Bonjour, comment puis-je vous aider ?";
    let mut harness = spawn_harness(FakeBackend::new(reply), ControllerConfig::default());

    wait_for_phase(&mut harness, CallPhase::Listening).await;
    harness.utterances.send(final_event("Bonjour")).await.unwrap();

    wait_for_phase(&mut harness, CallPhase::Thinking).await;
    wait_for_phase(&mut harness, CallPhase::Speaking).await;
    wait_for_phase(&mut harness, CallPhase::Listening).await;

    assert_eq!(*harness.asks.lock(), 1);

    // The reply went out as mu-law: one byte per PCM16 sample pair.
    let media = harness.sink.media.lock();
    let total: usize = media.iter().map(|b| BASE64.decode(b).unwrap().len()).sum();
    assert_eq!(total, reply.chars().count() * 80);
    drop(media);

    // One mark after the logical reply end.
    assert_eq!(harness.sink.marks.lock().len(), 1);

    harness.cancel.cancel();
    drop(harness.utterances);
    harness.controller_task.await.unwrap();
    harness.sender_task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_barge_in_mid_reply() {
    // One long sentence so the first chunk spans many segments.
    let reply = "This is a very long reply that keeps going with more and more detail \
                 so the caller has every opportunity to interrupt the answer midway through.";
    let mut harness = spawn_harness(FakeBackend::new(reply), ControllerConfig::default());

    wait_for_phase(&mut harness, CallPhase::Listening).await;
    harness.utterances.send(final_event("Tell me")).await.unwrap();
    wait_for_phase(&mut harness, CallPhase::Speaking).await;

    // Let roughly three segments go out.
    tokio::time::sleep(Duration::from_millis(180)).await;
    let written_before = harness.sink.media.lock().len();
    assert!(written_before >= 2, "no audio in flight yet");

    harness
        .utterances
        .send(UtteranceEvent::speech_started(3000))
        .await
        .unwrap();

    // Interruption completes within ~100ms.
    tokio::time::timeout(
        Duration::from_millis(100),
        harness.phase.wait_for(|p| *p == CallPhase::Listening),
    )
    .await
    .expect("interruption exceeded 100ms")
    .unwrap();

    // At most one further segment after the interrupt.
    let written_after = harness.sink.media.lock().len();
    assert!(
        written_after <= written_before + 1,
        "wrote {written_after} after {written_before}"
    );

    // Queue emptied, cancellation observed by the streamer.
    assert_eq!(harness.queue.pending_chars(), 0);
    let cancel = harness.captured_cancel.lock().clone().unwrap();
    assert!(cancel.is_cancelled());

    // The partially spoken prefix was logged as the system turn.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let logged = harness.logged.lock();
    let partial = logged.last().expect("no partial logged");
    assert!(reply.starts_with(partial.as_str()));
    assert!(partial.len() < reply.len());
    drop(logged);

    // No mark for the abandoned reply.
    assert!(harness.sink.marks.lock().is_empty());

    harness.cancel.cancel();
    drop(harness.utterances);
    harness.controller_task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_backend_timeout_speaks_fallback_once() {
    let mut harness = spawn_harness(FakeBackend::stalled(), ControllerConfig::default());

    wait_for_phase(&mut harness, CallPhase::Listening).await;
    harness.utterances.send(final_event("Hello?")).await.unwrap();

    wait_for_phase(&mut harness, CallPhase::Thinking).await;
    // Paused time fast-forwards through the 30s read timeout.
    wait_for_phase(&mut harness, CallPhase::Speaking).await;
    wait_for_phase(&mut harness, CallPhase::Listening).await;

    let fallback_logs = harness
        .logged
        .lock()
        .iter()
        .filter(|t| t.as_str() == FALLBACK_SENTENCE)
        .count();
    assert_eq!(fallback_logs, 1);

    // The fallback audio was actually spoken, exactly once.
    assert_eq!(harness.sink.marks.lock().len(), 1);
    assert!(!harness.sink.media.lock().is_empty());

    harness.cancel.cancel();
    drop(harness.utterances);
    harness.controller_task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_empty_final_stays_listening() {
    let mut harness = spawn_harness(
        FakeBackend::new("should never be asked"),
        ControllerConfig::default(),
    );

    wait_for_phase(&mut harness, CallPhase::Listening).await;
    harness
        .utterances
        .send(UtteranceEvent::empty_final(1000, 1500))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(*harness.asks.lock(), 0);
    assert_eq!(*harness.phase.borrow(), CallPhase::Listening);
    assert!(harness.sink.media.lock().is_empty());

    harness.cancel.cancel();
    drop(harness.utterances);
    harness.controller_task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_teardown_mid_reply() {
    let reply = "A long answer that will be cut off by the provider hanging up the call \
                 before the audio has finished draining to the caller.";
    let mut harness = spawn_harness(FakeBackend::new(reply), ControllerConfig::default());

    wait_for_phase(&mut harness, CallPhase::Listening).await;
    harness.utterances.send(final_event("Question")).await.unwrap();
    wait_for_phase(&mut harness, CallPhase::Speaking).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Provider stop: runtime cancels the session and drops the event
    // channel.
    harness.cancel.cancel();
    drop(harness.utterances);

    harness.controller_task.await.unwrap();
    // Queue close unblocks the sender promptly.
    harness.sender_task.await.unwrap().unwrap();
    assert_eq!(*harness.phase.borrow(), CallPhase::Ended);

    // The in-flight request observed the cancellation.
    let cancel = harness.captured_cancel.lock().clone().unwrap();
    assert!(cancel.is_cancelled());

    // No further outbound media after teardown.
    let frozen = harness.sink.media.lock().len();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(harness.sink.media.lock().len(), frozen);
}

#[tokio::test(start_paused = true)]
async fn test_greeting_spoken_and_logged() {
    let config = ControllerConfig {
        greeting: "Hello! How can I help you today?".to_string(),
        ..Default::default()
    };
    let mut harness = spawn_harness(FakeBackend::new("unused"), config);

    wait_for_phase(&mut harness, CallPhase::Speaking).await;
    wait_for_phase(&mut harness, CallPhase::Listening).await;

    assert!(!harness.sink.media.lock().is_empty());
    assert_eq!(harness.sink.marks.lock().len(), 1);
    assert_eq!(
        harness.logged.lock().first().map(String::as_str),
        Some("Hello! How can I help you today?")
    );

    harness.cancel.cancel();
    drop(harness.utterances);
    harness.controller_task.await.unwrap();
}
