//! Speech sender
//!
//! Consumes text chunks from the [`TextQueue`], synthesizes each one,
//! converts the audio to wire-format mu-law, and paces fixed-size
//! segments onto the provider WebSocket. The sender is the only writer
//! of outbound media; interruption is observed at segment boundaries so
//! barge-in takes effect within one segment (~64ms of audio).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use callbridge_core::codec::{apply_fade_in, pcm16_to_mulaw, resample_pcm16};
use callbridge_core::{Error, OutboundSink, Result, SpeechSynthesizer, WIRE_RATE_HZ};

use crate::text_queue::{TextChunk, TextQueue};

/// Consecutive send/synthesis failures before the sender gives up.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Fade-in applied at the start of each reply to avoid onset clicks.
const FADE_IN_MS: u32 = 20;

/// Sender configuration.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Mu-law bytes per outbound media segment
    pub segment_bytes: usize,
    /// How far ahead of real time each segment may be written
    pub pacing_slack: Duration,
    /// Sample rate of the synthesizer output in Hz
    pub native_rate: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            segment_bytes: 512,
            pacing_slack: Duration::from_millis(10),
            native_rate: 24000,
        }
    }
}

/// Events the sender reports to the dialogue controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderEvent {
    /// All audio of a reply has been written and its mark sent.
    ReplyFinished { reply: u64 },
}

/// Shared view of the sender for the dialogue controller.
#[derive(Clone)]
pub struct SenderHandle {
    interrupt: Arc<AtomicBool>,
    transmitting: Arc<AtomicBool>,
    spoken: Arc<Mutex<String>>,
}

impl SenderHandle {
    /// Request that the in-flight chunk be abandoned at the next
    /// segment boundary. The sender clears the flag after abandoning.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    /// Whether a chunk is currently being synthesized or transmitted.
    pub fn is_transmitting(&self) -> bool {
        self.transmitting.load(Ordering::SeqCst)
    }

    /// Take the text transmitted since the last call. On interruption
    /// this is the word-boundary prefix that actually went out.
    pub fn take_spoken(&self) -> String {
        let mut spoken = self.spoken.lock();
        std::mem::take(&mut *spoken).trim().to_string()
    }
}

/// Paced outbound speech task. One per call session.
pub struct SpeechSender {
    config: SenderConfig,
    queue: Arc<TextQueue>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    sink: Arc<dyn OutboundSink>,
    events: mpsc::Sender<SenderEvent>,
    interrupt: Arc<AtomicBool>,
    transmitting: Arc<AtomicBool>,
    spoken: Arc<Mutex<String>>,
    consecutive_errors: u32,
}

impl SpeechSender {
    pub fn new(
        config: SenderConfig,
        queue: Arc<TextQueue>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        sink: Arc<dyn OutboundSink>,
        events: mpsc::Sender<SenderEvent>,
    ) -> (Self, SenderHandle) {
        let interrupt = Arc::new(AtomicBool::new(false));
        let transmitting = Arc::new(AtomicBool::new(false));
        let spoken = Arc::new(Mutex::new(String::new()));

        let handle = SenderHandle {
            interrupt: interrupt.clone(),
            transmitting: transmitting.clone(),
            spoken: spoken.clone(),
        };

        let sender = Self {
            config,
            queue,
            synthesizer,
            sink,
            events,
            interrupt,
            transmitting,
            spoken,
            consecutive_errors: 0,
        };

        (sender, handle)
    }

    /// Run until the queue closes. Returns `Err` only on a fatal
    /// condition (error counter exhausted); the session runtime tears
    /// the call down in response.
    pub async fn run(mut self) -> Result<()> {
        while let Some(chunk) = self.queue.next_chunk().await {
            // A flag left over from an interruption that landed between
            // chunks has nothing to abandon; the queue flush already
            // removed the rest of that reply.
            self.interrupt.swap(false, Ordering::SeqCst);

            if chunk.text.is_empty() {
                if chunk.is_final {
                    self.finish_reply(&chunk).await?;
                }
                continue;
            }

            self.transmitting.store(true, Ordering::SeqCst);
            let result = self.speak_chunk(&chunk).await;
            self.transmitting.store(false, Ordering::SeqCst);

            match result {
                Ok(completed) => {
                    if completed && chunk.is_final {
                        self.finish_reply(&chunk).await?;
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, chunk = chunk.index, "chunk skipped");
                }
            }
        }

        tracing::debug!("text queue closed, speech sender exiting");
        Ok(())
    }

    /// Synthesize and transmit one chunk. Returns `Ok(true)` when every
    /// segment went out, `Ok(false)` when the chunk was abandoned by an
    /// interrupt.
    async fn speak_chunk(&mut self, chunk: &TextChunk) -> Result<bool> {
        let pcm = match self.synthesizer.synthesize(&chunk.text).await {
            Ok(pcm) => pcm,
            Err(e) => {
                self.bump_errors()?;
                return Err(e);
            }
        };

        let pcm = if chunk.index == 0 {
            apply_fade_in(&pcm, self.config.native_rate, FADE_IN_MS, 0)
        } else {
            pcm
        };

        let pcm8k = resample_pcm16(&pcm, self.config.native_rate, WIRE_RATE_HZ);
        let mulaw = pcm16_to_mulaw(&pcm8k);
        let segments: Vec<&[u8]> = mulaw.chunks(self.config.segment_bytes).collect();
        let total = segments.len();

        let mut deadline = tokio::time::Instant::now();
        for (sent, segment) in segments.iter().enumerate() {
            if self.interrupt.swap(false, Ordering::SeqCst) {
                let prefix = spoken_prefix(&chunk.text, sent, total);
                if !prefix.is_empty() {
                    let mut spoken = self.spoken.lock();
                    spoken.push_str(prefix);
                    spoken.push(' ');
                }
                tracing::debug!(
                    sent,
                    total,
                    reply = chunk.reply,
                    "chunk abandoned at segment boundary"
                );
                return Ok(false);
            }

            let payload = BASE64.encode(segment);
            if let Err(e) = self.send_with_retry(&payload).await {
                tracing::warn!(error = %e, segment = sent, "media segment dropped");
                self.bump_errors()?;
            } else {
                self.consecutive_errors = 0;
            }

            deadline += Duration::from_secs_f64(segment.len() as f64 / WIRE_RATE_HZ as f64);
            let target = deadline
                .checked_sub(self.config.pacing_slack)
                .unwrap_or(deadline);
            tokio::time::sleep_until(target).await;
        }

        {
            let mut spoken = self.spoken.lock();
            spoken.push_str(&chunk.text);
            spoken.push(' ');
        }

        Ok(true)
    }

    /// Emit the end-of-reply mark and notify the controller.
    async fn finish_reply(&mut self, chunk: &TextChunk) -> Result<()> {
        let name = format!("reply-{}", chunk.reply);
        if let Err(e) = self.sink.send_mark(&name).await {
            tracing::warn!(error = %e, mark = %name, "mark dropped");
            self.bump_errors()?;
        } else {
            self.consecutive_errors = 0;
        }

        if self
            .events
            .send(SenderEvent::ReplyFinished { reply: chunk.reply })
            .await
            .is_err()
        {
            tracing::debug!("sender event channel closed");
        }
        Ok(())
    }

    /// One immediate retry per write; the second failure counts toward
    /// the fatal threshold.
    async fn send_with_retry(&self, payload: &str) -> Result<()> {
        match self.sink.send_media(payload).await {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::warn!(error = %first, "media write failed, retrying once");
                self.sink.send_media(payload).await
            }
        }
    }

    fn bump_errors(&mut self) -> Result<()> {
        self.consecutive_errors += 1;
        if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
            return Err(Error::Fatal(format!(
                "{} consecutive outbound failures",
                self.consecutive_errors
            )));
        }
        Ok(())
    }
}

/// Word-boundary prefix of `text` proportional to the segments that
/// actually went out.
fn spoken_prefix(text: &str, segments_sent: usize, segments_total: usize) -> &str {
    if segments_sent == 0 || segments_total == 0 {
        return "";
    }
    if segments_sent >= segments_total {
        return text;
    }

    let total_chars = text.chars().count();
    let target = total_chars * segments_sent / segments_total;

    let mut end = 0;
    let mut last_word_end = 0;
    for (count, (i, c)) in text.char_indices().enumerate() {
        if count >= target {
            break;
        }
        if c.is_whitespace() {
            last_word_end = i;
        }
        end = i + c.len_utf8();
    }

    if last_word_end > 0 {
        &text[..last_word_end]
    } else {
        &text[..end]
    }
}
