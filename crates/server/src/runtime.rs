//! Session runtime
//!
//! Owns the provider media WebSocket for one call: demultiplexes
//! control events, feeds inbound media to the inbound pipeline, and
//! supervises the three per-call tasks (inbound pipeline, speech
//! sender, dialogue controller). The socket is read by exactly this
//! loop and written by exactly the speech sender, through the locked
//! [`WsSink`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};

use callbridge_core::{AudioFrame, CallPhase, CancelToken, Error, OutboundSink, Result};
use callbridge_dialogue::{ControllerConfig, DialogueController};
use callbridge_pipeline::{
    InboundConfig, InboundPipeline, SenderConfig, SpeechSender, TextQueue, VadConfig,
};

use crate::diagnostics::InboundDump;
use crate::metrics::{record_call_ended, record_call_started};
use crate::protocol::{self, ProviderEvent, StartMeta};
use crate::session::CallSession;
use crate::state::AppState;

/// How long teardown waits for per-call tasks to finish.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Cadence of the supervision tick that notices external hangups
/// (registry sweeps).
const SUPERVISION_TICK: Duration = Duration::from_secs(5);

type SharedWsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Outbound side of the socket: a send lock serializes writes so the
/// speech sender is the socket's single media writer.
pub struct WsSink {
    sender: SharedWsSender,
    stream_sid: String,
}

#[async_trait]
impl OutboundSink for WsSink {
    async fn send_media(&self, payload_b64: &str) -> Result<()> {
        let frame = protocol::media_frame(&self.stream_sid, payload_b64);
        let mut sender = self.sender.lock().await;
        sender
            .send(Message::Text(frame))
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))
    }

    async fn send_mark(&self, name: &str) -> Result<()> {
        let frame = protocol::mark_frame(&self.stream_sid, name);
        let mut sender = self.sender.lock().await;
        sender
            .send(Message::Text(frame))
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))
    }
}

/// Handle one provider WebSocket connection for its whole lifetime.
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let ws_sender: SharedWsSender = Arc::new(Mutex::new(ws_sender));

    // The provider sends `connected` then `start`; nothing meaningful
    // can happen before the stream id is known.
    let Some((stream_sid, start)) = await_start(&mut ws_receiver).await else {
        tracing::info!("socket closed before start event");
        return;
    };

    if !start.media_format.is_supported() {
        tracing::error!(
            encoding = %start.media_format.encoding,
            sample_rate = start.media_format.sample_rate,
            "unsupported media format, refusing call"
        );
        close_socket(&ws_sender, close_code::POLICY, "unsupported media format").await;
        return;
    }

    run_call(stream_sid, start, ws_sender, ws_receiver, state).await;
}

async fn await_start(
    receiver: &mut futures::stream::SplitStream<WebSocket>,
) -> Option<(String, StartMeta)> {
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match protocol::parse_event(&text) {
                Ok(ProviderEvent::Connected { .. }) => continue,
                Ok(ProviderEvent::Start { stream_sid, start }) => {
                    return Some((stream_sid, start))
                }
                Ok(other) => {
                    tracing::warn!(event = ?other, "event before start dropped");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "malformed frame before start dropped");
                }
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!(error = %e, "socket error before start");
                return None;
            }
        }
    }
    None
}

async fn run_call(
    stream_sid: String,
    start: StartMeta,
    ws_sender: SharedWsSender,
    mut ws_receiver: futures::stream::SplitStream<WebSocket>,
    state: AppState,
) {
    let settings = state.settings.clone();
    let cancel = CancelToken::new();
    let (phase_tx, phase_rx) = watch::channel(CallPhase::Starting);
    let phase_tx = Arc::new(phase_tx);

    let session = Arc::new(CallSession::new(
        stream_sid.clone(),
        start.call_sid.clone(),
        start.from.clone(),
        phase_rx,
        cancel.clone(),
    ));

    if let Err(e) = state.registry.insert(session.clone()) {
        tracing::error!(error = %e, "refusing call");
        close_socket(&ws_sender, close_code::AGAIN, "at capacity").await;
        return;
    }
    record_call_started();

    tracing::info!(
        stream_sid = %stream_sid,
        call_sid = %start.call_sid,
        caller = start.from.as_deref().unwrap_or("unknown"),
        "call started"
    );

    // Wire the per-call components.
    let (event_tx, event_rx) = mpsc::channel(64);
    let (sender_event_tx, sender_event_rx) = mpsc::channel(8);
    let queue = Arc::new(TextQueue::new());

    let inbound_config = InboundConfig {
        vad: VadConfig::from(&settings.vad),
        asr_sample_rate: settings.asr.sample_rate,
        idle_timeout: Duration::from_millis(settings.vad.idle_timeout_ms),
        ..Default::default()
    };
    let (inbound_handle, inbound) =
        InboundPipeline::new(inbound_config, state.recognizer.clone(), event_tx);

    let sink = Arc::new(WsSink {
        sender: ws_sender.clone(),
        stream_sid: stream_sid.clone(),
    });
    let sender_config = SenderConfig {
        segment_bytes: settings.outbound.segment_bytes,
        pacing_slack: Duration::from_millis(settings.outbound.pacing_slack_ms),
        native_rate: state.synthesizer.native_rate(),
    };
    let (speech_sender, sender_handle) = SpeechSender::new(
        sender_config,
        queue.clone(),
        state.synthesizer.clone(),
        sink,
        sender_event_tx,
    );

    let controller = DialogueController::new(
        ControllerConfig::from_settings(&settings.backend, &settings.dialogue),
        start.call_sid.clone(),
        state.backend.clone(),
        queue.clone(),
        sender_handle,
        sender_event_rx,
        event_rx,
        phase_tx,
        cancel.clone(),
    );

    let inbound_task = tokio::spawn(inbound.run());
    let mut sender_task = tokio::spawn(speech_sender.run());
    let mut controller_task = tokio::spawn(controller.run());

    let mut dump = InboundDump::create(&settings.diagnostics, &stream_sid);
    let mut tick = tokio::time::interval(SUPERVISION_TICK);
    let started = Instant::now();
    let mut sequence: u64 = 0;
    let mut fatal = false;
    let mut sender_joined = false;
    let mut controller_joined = false;

    loop {
        tokio::select! {
            message = ws_receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    session.touch();
                    match protocol::parse_event(&text) {
                        Ok(ProviderEvent::Media { media, .. }) => {
                            match BASE64.decode(&media.payload) {
                                Ok(payload) => {
                                    if let Some(dump) = dump.as_mut() {
                                        dump.write_mulaw(&payload);
                                    }
                                    let timestamp_ms = media
                                        .timestamp
                                        .as_deref()
                                        .and_then(|t| t.parse().ok())
                                        .unwrap_or_else(|| started.elapsed().as_millis() as u64);
                                    inbound_handle.push_frame(AudioFrame::inbound(
                                        sequence,
                                        timestamp_ms,
                                        payload,
                                    ));
                                    sequence += 1;
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "undecodable media payload dropped");
                                }
                            }
                        }
                        Ok(ProviderEvent::Mark { mark, .. }) => {
                            tracing::debug!(mark = %mark.name, "provider drained playback");
                        }
                        Ok(ProviderEvent::Stop { .. }) => {
                            tracing::info!(stream_sid = %stream_sid, "provider stop");
                            break;
                        }
                        Ok(ProviderEvent::Start { .. }) => {
                            tracing::warn!("duplicate start event dropped");
                        }
                        Ok(ProviderEvent::Connected { .. }) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "malformed provider frame dropped");
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let mut sender = ws_sender.lock().await;
                    let _ = sender.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    tracing::info!(stream_sid = %stream_sid, "provider closed socket");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!(error = %e, "socket read error");
                    fatal = true;
                    break;
                }
                None => break,
            },
            result = &mut sender_task, if !sender_joined => {
                sender_joined = true;
                match result {
                    Ok(Ok(())) => tracing::debug!("speech sender finished"),
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "speech sender fatal");
                        fatal = true;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "speech sender panicked");
                        fatal = true;
                    }
                }
                break;
            },
            result = &mut controller_task, if !controller_joined => {
                controller_joined = true;
                if let Err(e) = result {
                    tracing::error!(error = %e, "dialogue controller panicked");
                    fatal = true;
                } else if !cancel.is_cancelled() {
                    tracing::error!("dialogue controller exited unexpectedly");
                    fatal = true;
                }
                break;
            },
            _ = tick.tick() => {
                if session.is_cancelled() {
                    tracing::info!(stream_sid = %stream_sid, "session cancelled externally");
                    break;
                }
            }
        }
    }

    // Teardown: cancel the task tree, stop outbound audio, close the
    // recognizer stream (the inbound pipeline does that on exit), and
    // close the socket.
    cancel.cancel();
    queue.flush();
    queue.close();
    drop(inbound_handle);

    let _ = tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, inbound_task).await;
    if !sender_joined {
        let _ = tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, &mut sender_task).await;
    }
    if !controller_joined {
        let _ = tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, &mut controller_task).await;
    }

    if let Some(dump) = dump.take() {
        dump.finalize();
    }

    if fatal {
        close_socket(&ws_sender, close_code::ERROR, "internal error").await;
    } else {
        close_socket(&ws_sender, close_code::NORMAL, "call ended").await;
    }

    state.registry.remove(&stream_sid);
    record_call_ended(fatal);
    tracing::info!(
        stream_sid = %stream_sid,
        duration_s = started.elapsed().as_secs(),
        fatal,
        "call ended"
    );
}

async fn close_socket(sender: &SharedWsSender, code: u16, reason: &'static str) {
    let mut sender = sender.lock().await;
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
