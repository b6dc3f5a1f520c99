//! C5: the per-call audio bridge between the carrier media-stream
//! web-socket and a `ModelSession`, including the playback-barrier pattern
//! for hangup and DTMF injection.

use crate::audio::mulaw;
use crate::call::manager::CallManager;
use crate::constants::{DTMF_BARRIER_TIMEOUT_MS, HANGUP_BARRIER_TIMEOUT_MS};
use crate::call::record::Speaker;
use crate::model::session::{ModelEvent, ModelSession, ModelSessionConfig};
use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum InboundFrame {
    Connected,
    Start { #[serde(rename = "streamSid")] stream_sid: String, start: StartPayload },
    Media { media: MediaPayload },
    Stop,
    Mark { mark: MarkPayload },
}

#[derive(Debug, Deserialize)]
struct StartPayload {
    #[serde(rename = "callSid")]
    call_sid: String,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    payload: String,
}

#[derive(Debug, Deserialize)]
struct MarkPayload {
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum OutboundFrame<'a> {
    Media { #[serde(rename = "streamSid")] stream_sid: &'a str, media: OutboundMedia },
    Mark { #[serde(rename = "streamSid")] stream_sid: &'a str, mark: OutboundMark<'a> },
}

#[derive(Debug, Serialize)]
struct OutboundMedia {
    payload: String,
}

#[derive(Debug, Serialize)]
struct OutboundMark<'a> {
    name: &'a str,
}

/// Shared across every media-stream connection so duplicate upgrades for
/// the same `providerCallId` (the carrier occasionally double-connects)
/// can be detected and closed (§4.5 point 2, scenario S2).
pub struct AudioBridge {
    manager: Arc<CallManager>,
    openai_api_key: String,
    active_provider_call_ids: Mutex<HashSet<String>>,
}

impl AudioBridge {
    pub fn new(manager: Arc<CallManager>, openai_api_key: String) -> Self {
        Self {
            manager,
            openai_api_key,
            active_provider_call_ids: Mutex::new(HashSet::new()),
        }
    }

    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut sender, mut receiver) = socket.split();

        // Wait for `start` before anything else is meaningful.
        let (stream_sid, provider_call_id) = loop {
            let message = match receiver.next().await {
                Some(Ok(message)) => message,
                _ => return,
            };
            let Message::Text(text) = message else { continue };
            match serde_json::from_str::<InboundFrame>(&text) {
                Ok(InboundFrame::Connected) => continue,
                Ok(InboundFrame::Start { stream_sid, start }) => break (stream_sid, start.call_sid),
                Ok(_) => continue,
                Err(e) => {
                    warn!("unrecognized media-stream frame before start: {e}");
                    continue;
                }
            }
        };

        {
            let mut active = self.active_provider_call_ids.lock().await;
            if !active.insert(provider_call_id.clone()) {
                info!(provider_call_id, "duplicate media-stream upgrade, closing");
                let _ = sender.close().await;
                return;
            }
        }
        let _guard = DuplicateGuard { bridge: self.clone(), provider_call_id: provider_call_id.clone() };

        let call_id = match self.manager.call_id_for_provider_call_id(&provider_call_id).await {
            Some(id) => id,
            None => {
                warn!(provider_call_id, "media-stream start for unknown call");
                let _ = sender.close().await;
                return;
            }
        };

        let persona_prompt = self
            .manager
            .get_persona_prompt(&call_id)
            .await
            .unwrap_or_else(|| "Be polite and concise.".to_string());
        let initial_greeting = self.manager.get_initial_greeting(&call_id).await;

        let mut model_config = ModelSessionConfig::new(self.openai_api_key.clone(), persona_prompt);
        model_config.initial_greeting = initial_greeting;

        let (model_session, mut model_events) = match ModelSession::connect(model_config).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(call_id, "model session connect failed: {e}");
                let _ = sender.close().await;
                return;
            }
        };

        self.manager.mark_active(&call_id).await;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let barrier = Arc::new(PlaybackBarrier::new());

        // Pump model events: audio frames go straight to the carrier;
        // transcripts go to C6; hangup/DTMF drive the playback barrier.
        let event_manager = self.manager.clone();
        let event_call_id = call_id.clone();
        let event_stream_sid = stream_sid.clone();
        let event_outbound = outbound_tx.clone();
        let event_barrier = barrier.clone();
        let event_task = tokio::spawn(async move {
            while let Some(event) = model_events.recv().await {
                match event {
                    ModelEvent::AudioOutput(bytes) => {
                        event_manager.mark_speaking(&event_call_id).await;
                        let payload = base64::engine::general_purpose::STANDARD.encode(&bytes);
                        let frame = OutboundFrame::Media {
                            stream_sid: &event_stream_sid,
                            media: OutboundMedia { payload },
                        };
                        let _ = send_frame(&event_outbound, &frame);
                    }
                    ModelEvent::UserTranscript(text) => {
                        event_manager.add_transcript(&event_call_id, Speaker::User, text, true).await;
                    }
                    ModelEvent::AssistantTranscript(text) => {
                        event_manager.add_transcript(&event_call_id, Speaker::Bot, text, true).await;
                    }
                    ModelEvent::SpeechStart => {
                        event_manager.mark_listening(&event_call_id).await;
                    }
                    ModelEvent::ResponseDone => {}
                    ModelEvent::HangupRequested(reason) => {
                        if !event_barrier.begin_hangup() {
                            continue; // duplicate within one response — ignored (§4.5)
                        }
                        let outbound = event_outbound.clone();
                        let stream_sid = event_stream_sid.clone();
                        let barrier = event_barrier.clone();
                        let manager = event_manager.clone();
                        let call_id = event_call_id.clone();
                        tokio::spawn(async move {
                            let _ = send_frame(
                                &outbound,
                                &OutboundFrame::Mark { stream_sid: &stream_sid, mark: OutboundMark { name: "hangup" } },
                            );
                            barrier.wait_hangup(Duration::from_millis(HANGUP_BARRIER_TIMEOUT_MS)).await;
                            info!(call_id, reason, "hangup barrier resolved, requesting provider hangup");
                            if let Err(e) = manager.request_provider_hangup(&call_id).await {
                                warn!(call_id, "provider hangup failed: {e}");
                            }
                        });
                    }
                    ModelEvent::DtmfRequested(digits) => {
                        let outbound = event_outbound.clone();
                        let stream_sid = event_stream_sid.clone();
                        let barrier = event_barrier.clone();
                        tokio::spawn(async move {
                            let _ = send_frame(
                                &outbound,
                                &OutboundFrame::Mark { stream_sid: &stream_sid, mark: OutboundMark { name: "dtmf" } },
                            );
                            barrier.wait_dtmf(Duration::from_millis(DTMF_BARRIER_TIMEOUT_MS)).await;
                            let audio = mulaw::generate_dtmf(&digits, None, None);
                            for frame in mulaw::chunk_for_stream(&audio, None) {
                                let payload = base64::engine::general_purpose::STANDARD.encode(&frame);
                                let _ = send_frame(
                                    &outbound,
                                    &OutboundFrame::Media { stream_sid: &stream_sid, media: OutboundMedia { payload } },
                                );
                            }
                        });
                    }
                }
            }
        });

        // Main pump: carrier frames in, queued outbound frames out.
        loop {
            tokio::select! {
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(message) => {
                            if sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                inbound = receiver.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<InboundFrame>(&text) {
                                Ok(InboundFrame::Media { media }) => {
                                    match base64::engine::general_purpose::STANDARD.decode(&media.payload) {
                                        Ok(bytes) => {
                                            if let Err(e) = model_session.send_audio(&bytes) {
                                                warn!("failed to forward audio to model: {e}");
                                            }
                                        }
                                        Err(e) => warn!("bad media payload base64: {e}"),
                                    }
                                }
                                Ok(InboundFrame::Mark { mark }) => {
                                    barrier.resolve(&mark.name);
                                }
                                Ok(InboundFrame::Stop) => break,
                                Ok(InboundFrame::Connected) | Ok(InboundFrame::Start { .. }) => {}
                                Err(e) => warn!("unrecognized media-stream frame: {e}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("media-stream read error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        event_task.abort();
        let _ = sender.close().await;
    }
}

/// Drops the `providerCallId` reservation when the connection's handling
/// task exits via any path (normal stop, error, early return).
struct DuplicateGuard {
    bridge: Arc<AudioBridge>,
    provider_call_id: String,
}

impl Drop for DuplicateGuard {
    fn drop(&mut self) {
        let bridge = self.bridge.clone();
        let provider_call_id = self.provider_call_id.clone();
        tokio::spawn(async move {
            bridge.active_provider_call_ids.lock().await.remove(&provider_call_id);
        });
    }
}

fn send_frame(outbound: &mpsc::UnboundedSender<Message>, frame: &OutboundFrame<'_>) -> Result<(), String> {
    let json = serde_json::to_string(frame).map_err(|e| format!("failed to encode media-stream frame: {e}"))?;
    outbound.send(Message::Text(json)).map_err(|_| "media-stream writer has exited".to_string())
}

/// The hangup/DTMF mark-and-wait pattern (§4.5): send a named mark, then
/// wait for its echo or a timeout before performing the side effect.
struct PlaybackBarrier {
    hangup_pending: std::sync::atomic::AtomicBool,
    hangup_tx: Mutex<Option<oneshot::Sender<()>>>,
    dtmf_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl PlaybackBarrier {
    fn new() -> Self {
        Self {
            hangup_pending: std::sync::atomic::AtomicBool::new(false),
            hangup_tx: Mutex::new(None),
            dtmf_tx: Mutex::new(None),
        }
    }

    /// Returns `false` if a hangup is already pending (duplicate, ignored).
    fn begin_hangup(&self) -> bool {
        self.hangup_pending
            .compare_exchange(false, true, std::sync::atomic::Ordering::SeqCst, std::sync::atomic::Ordering::SeqCst)
            .is_ok()
    }

    async fn wait_hangup(&self, timeout: Duration) {
        let (tx, rx) = oneshot::channel();
        *self.hangup_tx.lock().await = Some(tx);
        let _ = tokio::time::timeout(timeout, rx).await;
    }

    async fn wait_dtmf(&self, timeout: Duration) {
        let (tx, rx) = oneshot::channel();
        *self.dtmf_tx.lock().await = Some(tx);
        let _ = tokio::time::timeout(timeout, rx).await;
    }

    /// Resolve whichever latch matches the echoed mark name. Single-shot:
    /// a second echo of the same name with no new latch registered is a
    /// silent no-op — this is what makes injection "exactly once per
    /// request" regardless of any stray re-delivered mark (§9 open question).
    fn resolve(&self, name: &str) {
        let lock = match name {
            "hangup" => &self.hangup_tx,
            "dtmf" => &self.dtmf_tx,
            _ => return,
        };
        if let Ok(mut guard) = lock.try_lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(());
            }
        }
    }
}
