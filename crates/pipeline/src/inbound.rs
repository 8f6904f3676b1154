//! Inbound pipeline
//!
//! Turns inbound mu-law frames into utterance events: decodes the wire
//! format, gates audio through the energy VAD, bridges confirmed speech
//! into a streaming recognizer, and emits events in the fixed order
//! `speech-started`, partials, `final`, `speech-ended` per utterance.
//!
//! Recognizer failures never drop the call: the current utterance is
//! terminated with an empty low-confidence final and a fresh stream is
//! opened on the next speech start.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use callbridge_core::codec::{mulaw_to_pcm16, resample_pcm16};
use callbridge_core::{
    AsrStream, AudioFrame, SpeechRecognizer, Transcript, UtteranceEvent, WIRE_RATE_HZ,
};

use crate::vad::{EnergyVad, VadConfig, VadEvent};

/// Frame-channel depth; pushes beyond this are dropped, not blocked.
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// Wire-rate PCM windows retained before speech confirmation, replayed
/// into the recognizer when the stream opens so utterance onsets are
/// not clipped.
const PREROLL_WINDOWS: usize = 10;

/// Inbound pipeline configuration.
#[derive(Debug, Clone)]
pub struct InboundConfig {
    /// VAD tuning
    pub vad: VadConfig,
    /// Sample rate the recognizer expects, in Hz
    pub asr_sample_rate: u32,
    /// Inbound inactivity before a synthetic speech-ended nudge
    pub idle_timeout: Duration,
    /// Recognizer finals at or above this confidence end the utterance
    /// before the VAD declares silence
    pub endpoint_confidence: f32,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            vad: VadConfig::default(),
            asr_sample_rate: 16000,
            idle_timeout: Duration::from_secs(30),
            endpoint_confidence: 0.85,
        }
    }
}

/// Non-blocking producer side of the inbound pipeline.
#[derive(Clone)]
pub struct InboundHandle {
    frames: mpsc::Sender<AudioFrame>,
    dropped: Arc<AtomicU64>,
}

impl InboundHandle {
    /// Buffer a frame for processing. Never blocks; returns false when
    /// the pipeline is congested or gone and the frame was dropped.
    pub fn push_frame(&self, frame: AudioFrame) -> bool {
        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 50 == 1 {
                    tracing::warn!(dropped, "inbound frames dropped");
                }
                false
            }
        }
    }

    /// Total frames dropped since the pipeline started.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct ActiveUtterance {
    stream: Box<dyn AsrStream>,
    partials: mpsc::Receiver<Transcript>,
    start_ms: u64,
}

enum StreamOutcome {
    Continue,
    Failed,
    Endpoint(Transcript),
}

/// Per-call inbound processing task.
pub struct InboundPipeline {
    config: InboundConfig,
    recognizer: Arc<dyn SpeechRecognizer>,
    frames: mpsc::Receiver<AudioFrame>,
    events: mpsc::Sender<UtteranceEvent>,
    vad: EnergyVad,
    utterance: Option<ActiveUtterance>,
    preroll: VecDeque<Vec<u8>>,
    last_ms: u64,
}

impl InboundPipeline {
    pub fn new(
        config: InboundConfig,
        recognizer: Arc<dyn SpeechRecognizer>,
        events: mpsc::Sender<UtteranceEvent>,
    ) -> (InboundHandle, Self) {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);

        let handle = InboundHandle {
            frames: frame_tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };

        let vad = EnergyVad::new(config.vad.clone());
        let pipeline = Self {
            config,
            recognizer,
            frames: frame_rx,
            events,
            vad,
            utterance: None,
            preroll: VecDeque::with_capacity(PREROLL_WINDOWS),
            last_ms: 0,
        };

        (handle, pipeline)
    }

    /// Run until every producer handle is dropped.
    pub async fn run(mut self) {
        loop {
            let frame = match tokio::time::timeout(self.config.idle_timeout, self.frames.recv())
                .await
            {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => {
                    self.on_idle_timeout().await;
                    continue;
                }
            };
            self.handle_frame(frame).await;
        }

        if let Some(utterance) = self.utterance.take() {
            let _ = utterance.stream.close().await;
        }
        tracing::debug!("inbound pipeline exiting");
    }

    async fn handle_frame(&mut self, frame: AudioFrame) {
        self.last_ms = frame.timestamp_ms;
        let pcm = mulaw_to_pcm16(&frame.payload);
        if pcm.is_empty() {
            return;
        }
        let window_ms = (frame.duration_ms(WIRE_RATE_HZ) as u32).max(1);

        match self.vad.process_window(&pcm, window_ms) {
            Some(VadEvent::SpeechStarted) => {
                let start_ms = frame
                    .timestamp_ms
                    .saturating_sub(self.config.vad.min_speech_ms as u64);
                self.emit(UtteranceEvent::speech_started(start_ms)).await;
                self.open_utterance(start_ms, frame.timestamp_ms).await;
            }
            Some(VadEvent::SpeechEnded) => {
                self.finish_utterance(frame.timestamp_ms).await;
                return;
            }
            None => {}
        }

        if self.utterance.is_some() {
            self.feed_stream(&pcm, frame.timestamp_ms).await;
        } else {
            self.push_preroll(pcm);
        }
    }

    fn push_preroll(&mut self, pcm: Vec<u8>) {
        if self.preroll.len() == PREROLL_WINDOWS {
            self.preroll.pop_front();
        }
        self.preroll.push_back(pcm);
    }

    async fn open_utterance(&mut self, start_ms: u64, now_ms: u64) {
        let (partial_tx, partial_rx) = mpsc::channel(32);

        match self.recognizer.open_stream(partial_tx).await {
            Ok(mut stream) => {
                // Replay the windows that confirmed the speech start.
                let preroll: Vec<u8> = self.preroll.drain(..).flatten().collect();
                if !preroll.is_empty() {
                    let resampled =
                        resample_pcm16(&preroll, WIRE_RATE_HZ, self.config.asr_sample_rate);
                    if let Err(e) = stream.send(&resampled).await {
                        tracing::warn!(error = %e, "recognizer rejected preroll");
                    }
                }
                self.utterance = Some(ActiveUtterance {
                    stream,
                    partials: partial_rx,
                    start_ms,
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to open recognizer stream");
                self.emit(UtteranceEvent::empty_final(start_ms, now_ms)).await;
                self.emit(UtteranceEvent::speech_ended(start_ms, now_ms)).await;
                self.vad.reset();
            }
        }
    }

    async fn feed_stream(&mut self, pcm: &[u8], now_ms: u64) {
        let resampled = resample_pcm16(pcm, WIRE_RATE_HZ, self.config.asr_sample_rate);

        let mut outcome = StreamOutcome::Continue;
        let mut partial_events = Vec::new();

        if let Some(utterance) = self.utterance.as_mut() {
            if let Err(e) = utterance.stream.send(&resampled).await {
                tracing::warn!(error = %e, "recognizer stream broke mid-utterance");
                outcome = StreamOutcome::Failed;
            } else {
                while let Ok(update) = utterance.partials.try_recv() {
                    if update.is_final && update.confidence >= self.config.endpoint_confidence {
                        outcome = StreamOutcome::Endpoint(update);
                        break;
                    }
                    partial_events.push(UtteranceEvent::partial(
                        update.text,
                        update.confidence,
                        utterance.start_ms,
                        now_ms,
                    ));
                }
            }
        }

        for event in partial_events {
            self.emit(event).await;
        }

        match outcome {
            StreamOutcome::Continue => {}
            StreamOutcome::Failed => self.fail_utterance(now_ms).await,
            StreamOutcome::Endpoint(transcript) => {
                self.endpoint_utterance(transcript, now_ms).await
            }
        }
    }

    /// VAD-declared end of utterance: close the stream for its final.
    async fn finish_utterance(&mut self, end_ms: u64) {
        let Some(utterance) = self.utterance.take() else {
            return;
        };
        let start_ms = utterance.start_ms;

        match utterance.stream.close().await {
            Ok(transcript) => {
                self.emit(UtteranceEvent::final_transcript(
                    transcript.text,
                    transcript.confidence,
                    start_ms,
                    end_ms,
                ))
                .await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "recognizer close failed");
                self.emit(UtteranceEvent::empty_final(start_ms, end_ms)).await;
            }
        }
        self.emit(UtteranceEvent::speech_ended(start_ms, end_ms)).await;
    }

    /// Recognizer reported a confident final before the VAD saw
    /// silence: finish immediately for responsiveness.
    async fn endpoint_utterance(&mut self, transcript: Transcript, end_ms: u64) {
        let Some(utterance) = self.utterance.take() else {
            return;
        };
        let start_ms = utterance.start_ms;
        let _ = utterance.stream.close().await;

        self.emit(UtteranceEvent::final_transcript(
            transcript.text,
            transcript.confidence,
            start_ms,
            end_ms,
        ))
        .await;
        self.emit(UtteranceEvent::speech_ended(start_ms, end_ms)).await;
        self.vad.reset();
    }

    /// Stream failure: terminate the utterance with an empty final.
    async fn fail_utterance(&mut self, end_ms: u64) {
        let Some(utterance) = self.utterance.take() else {
            return;
        };
        let start_ms = utterance.start_ms;
        drop(utterance.stream);

        self.emit(UtteranceEvent::empty_final(start_ms, end_ms)).await;
        self.emit(UtteranceEvent::speech_ended(start_ms, end_ms)).await;
        self.vad.reset();
    }

    async fn on_idle_timeout(&mut self) {
        if self.utterance.is_some() {
            // The provider stopped sending mid-utterance; finalize what
            // the recognizer has.
            let end_ms = self.last_ms;
            self.finish_utterance(end_ms).await;
            self.vad.reset();
        } else {
            tracing::debug!(
                idle_ms = self.config.idle_timeout.as_millis() as u64,
                "no inbound audio, emitting synthetic speech-ended"
            );
            self.emit(UtteranceEvent::speech_ended(self.last_ms, self.last_ms))
                .await;
        }
    }

    async fn emit(&self, event: UtteranceEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("utterance event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use callbridge_core::codec::pcm16_to_mulaw;
    use callbridge_core::{Error, Result, UtteranceKind};
    use parking_lot::Mutex;

    struct FakeRecognizer {
        final_text: String,
        /// Fail `send` on the FIRST stream after this many successful
        /// calls; later streams are healthy (None = never fail)
        fail_after_sends: Option<usize>,
        /// Push a confident final through the partial channel after
        /// this many sends (None = never)
        endpoint_after_sends: Option<usize>,
        opens: Arc<Mutex<usize>>,
    }

    struct FakeStream {
        final_text: String,
        sends: usize,
        fail_after_sends: Option<usize>,
        endpoint_after_sends: Option<usize>,
        updates: mpsc::Sender<Transcript>,
    }

    #[async_trait]
    impl SpeechRecognizer for FakeRecognizer {
        async fn open_stream(
            &self,
            updates: mpsc::Sender<Transcript>,
        ) -> Result<Box<dyn AsrStream>> {
            let opens = {
                let mut opens = self.opens.lock();
                *opens += 1;
                *opens
            };
            Ok(Box::new(FakeStream {
                final_text: self.final_text.clone(),
                sends: 0,
                fail_after_sends: if opens == 1 { self.fail_after_sends } else { None },
                endpoint_after_sends: self.endpoint_after_sends,
                updates,
            }))
        }
    }

    #[async_trait]
    impl AsrStream for FakeStream {
        async fn send(&mut self, _pcm16: &[u8]) -> Result<()> {
            if let Some(limit) = self.fail_after_sends {
                if self.sends >= limit {
                    return Err(Error::Asr("stream reset by peer".into()));
                }
            }
            self.sends += 1;
            if self.sends == 2 {
                let _ = self
                    .updates
                    .send(Transcript::partial(&self.final_text[..2.min(self.final_text.len())], 0.4))
                    .await;
            }
            if Some(self.sends) == self.endpoint_after_sends {
                let _ = self
                    .updates
                    .send(Transcript::final_result(&self.final_text, 0.95))
                    .await;
            }
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<Transcript> {
            Ok(Transcript::final_result(&self.final_text, 0.9))
        }
    }

    fn voiced_payload() -> Vec<u8> {
        let sample = (0.3f32 * 32767.0) as i16;
        let pcm: Vec<u8> = sample
            .to_le_bytes()
            .iter()
            .cycle()
            .take(320)
            .copied()
            .collect();
        pcm16_to_mulaw(&pcm)
    }

    fn silent_payload() -> Vec<u8> {
        pcm16_to_mulaw(&vec![0u8; 320])
    }

    fn spawn_pipeline(
        recognizer: FakeRecognizer,
    ) -> (InboundHandle, mpsc::Receiver<UtteranceEvent>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (handle, pipeline) =
            InboundPipeline::new(InboundConfig::default(), Arc::new(recognizer), event_tx);
        tokio::spawn(pipeline.run());
        (handle, event_rx)
    }

    fn recognizer(final_text: &str) -> (FakeRecognizer, Arc<Mutex<usize>>) {
        let opens = Arc::new(Mutex::new(0));
        (
            FakeRecognizer {
                final_text: final_text.to_string(),
                fail_after_sends: None,
                endpoint_after_sends: None,
                opens: opens.clone(),
            },
            opens,
        )
    }

    async fn push_utterance(handle: &InboundHandle, voiced: usize, silent: usize) {
        let mut ts = 0u64;
        let mut seq = 0u64;
        for _ in 0..voiced {
            handle.push_frame(AudioFrame::inbound(seq, ts, voiced_payload()));
            seq += 1;
            ts += 20;
            tokio::task::yield_now().await;
        }
        for _ in 0..silent {
            handle.push_frame(AudioFrame::inbound(seq, ts, silent_payload()));
            seq += 1;
            ts += 20;
            tokio::task::yield_now().await;
        }
    }

    async fn collect_kinds(
        events: &mut mpsc::Receiver<UtteranceEvent>,
        until: UtteranceKind,
    ) -> Vec<UtteranceEvent> {
        let mut collected = Vec::new();
        while let Some(event) =
            tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for events")
        {
            let kind = event.kind;
            collected.push(event);
            if kind == until {
                break;
            }
        }
        collected
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_ordering_for_one_utterance() {
        let (rec, _opens) = recognizer("Bonjour");
        let (handle, mut events) = spawn_pipeline(rec);

        // 50 voiced frames (1s), then 30 silent (600ms).
        push_utterance(&handle, 50, 31).await;

        let collected = collect_kinds(&mut events, UtteranceKind::SpeechEnded).await;
        let kinds: Vec<UtteranceKind> = collected.iter().map(|e| e.kind).collect();

        assert_eq!(kinds.first(), Some(&UtteranceKind::SpeechStarted));
        assert_eq!(
            kinds[kinds.len() - 2..],
            [UtteranceKind::Final, UtteranceKind::SpeechEnded]
        );
        // Any event in between is a partial.
        for kind in &kinds[1..kinds.len() - 2] {
            assert_eq!(*kind, UtteranceKind::Partial);
        }

        let final_event = collected.iter().find(|e| e.is_final()).unwrap();
        assert_eq!(final_event.text, "Bonjour");
        assert!(final_event.confidence > 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_asr_failure_yields_empty_final_and_recovers() {
        let opens = Arc::new(Mutex::new(0));
        let rec = FakeRecognizer {
            final_text: "never delivered".into(),
            fail_after_sends: Some(3),
            endpoint_after_sends: None,
            opens: opens.clone(),
        };
        let (handle, mut events) = spawn_pipeline(rec);

        push_utterance(&handle, 30, 0).await;

        let collected = collect_kinds(&mut events, UtteranceKind::SpeechEnded).await;
        let finals: Vec<_> = collected.iter().filter(|e| e.is_final()).collect();
        assert_eq!(finals.len(), 1);
        assert!(finals[0].text.is_empty());
        assert_eq!(finals[0].confidence, 0.0);

        // Next utterance opens a fresh stream and completes normally.
        push_utterance(&handle, 30, 31).await;
        let collected = collect_kinds(&mut events, UtteranceKind::SpeechEnded).await;
        assert!(collected
            .iter()
            .any(|e| e.kind == UtteranceKind::SpeechStarted));
        assert_eq!(*opens.lock(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpointing_override_beats_vad_silence() {
        let opens = Arc::new(Mutex::new(0));
        let rec = FakeRecognizer {
            final_text: "short answer".into(),
            fail_after_sends: None,
            endpoint_after_sends: Some(10),
            opens,
        };
        let (handle, mut events) = spawn_pipeline(rec);

        // Voiced audio only; no VAD silence at all.
        push_utterance(&handle, 30, 0).await;

        let collected = collect_kinds(&mut events, UtteranceKind::SpeechEnded).await;
        let final_event = collected.iter().find(|e| e.is_final()).unwrap();
        assert_eq!(final_event.text, "short answer");
        assert!(final_event.confidence >= 0.85);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_emits_synthetic_speech_ended() {
        let (rec, _opens) = recognizer("unused");
        let (_handle, mut events) = spawn_pipeline(rec);

        // No frames at all; paused time fast-forwards the idle timer.
        let event = tokio::time::timeout(Duration::from_secs(60), events.recv())
            .await
            .expect("no synthetic event")
            .unwrap();
        assert_eq!(event.kind, UtteranceKind::SpeechEnded);
        assert!(event.text.is_empty());
    }
}
