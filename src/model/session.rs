//! Drives the realtime model web-socket for one call: session
//! configuration, bidirectional audio, transcripts and tool-call dispatch.
//!
//! Grounded on this codebase's existing OpenAI Realtime client
//! (`voice/stt/openai_realtime.rs`): a `connect_async` request with a
//! bearer `Authorization` header and `OpenAI-Beta` header, a tagged
//! `ServerEvent` enum deserialized off the read half, and a tagged
//! `ClientEvent` enum serialized onto the write half.

use crate::constants::{MODEL_GREETING_DELAY_MS, MODEL_SESSION_UPDATE_DELAY_MS};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

const REALTIME_API_URL: &str = "wss://api.openai.com/v1/realtime";
const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview";
const DEFAULT_TEMPERATURE: f32 = 0.8;
const TRANSCRIPTION_MODEL: &str = "whisper-1";

const IVR_RUBRIC: &str = "\
You are navigating a phone call on behalf of a human operator. If you reach an automated \
interactive voice response (IVR) menu, listen to the options and use send_dtmf to press the \
digit that gets you closer to a human or to your stated goal. Do not narrate keypad presses out \
loud. If you reach a human, introduce yourself briefly and pursue your goal naturally. Call \
hangup only once your goal is resolved (or is clearly unreachable), giving a short reason.";

#[derive(Debug, Clone)]
pub struct ModelSessionConfig {
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub persona_prompt: String,
    pub initial_greeting: Option<String>,
    pub vad_threshold: f32,
    pub silence_duration_ms: u64,
}

impl ModelSessionConfig {
    pub fn new(api_key: String, persona_prompt: String) -> Self {
        Self {
            api_key,
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            persona_prompt,
            initial_greeting: None,
            vad_threshold: 0.5,
            silence_duration_ms: 800,
        }
    }

    fn instructions(&self) -> String {
        let today = chrono::Utc::now().format("%Y-%m-%d");
        format!("Today's date is {today}.\n\n{IVR_RUBRIC}\n\n{}", self.persona_prompt)
    }
}

/// Events surfaced from the model session to its owner (the audio bridge).
/// A single typed channel in place of one callback per concern (§9): easier
/// to drain and to cancel together on teardown.
#[derive(Debug, Clone)]
pub enum ModelEvent {
    AudioOutput(Vec<u8>),
    UserTranscript(String),
    AssistantTranscript(String),
    SpeechStart,
    ResponseDone,
    HangupRequested(String),
    DtmfRequested(String),
}

#[derive(Debug, Serialize)]
struct ToolDef {
    #[serde(rename = "type")]
    kind: &'static str,
    name: &'static str,
    description: &'static str,
    parameters: serde_json::Value,
}

fn tool_defs() -> Vec<ToolDef> {
    vec![
        ToolDef {
            kind: "function",
            name: "hangup",
            description: "End the call.",
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "reason": { "type": "string" } },
                "required": ["reason"],
            }),
        },
        ToolDef {
            kind: "function",
            name: "send_dtmf",
            description: "Press buttons on the keypad (touch-tone digits).",
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "digits": { "type": "string" } },
                "required": ["digits"],
            }),
        },
    ]
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: serde_json::Value },
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend { audio: String },
    #[serde(rename = "conversation.item.create")]
    ItemCreate { item: serde_json::Value },
    #[serde(rename = "response.create")]
    ResponseCreate,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "session.updated")]
    SessionUpdated {},
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {},
    #[serde(rename = "response.output_audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "response.output_audio_transcript.done")]
    AssistantTranscriptDone { transcript: String },
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    InputTranscriptDelta { item_id: String, delta: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptCompleted {
        item_id: String,
        #[serde(default)]
        transcript: Option<String>,
    },
    #[serde(rename = "response.done")]
    ResponseDone { response: ResponseBody },
    #[serde(rename = "error")]
    Error { error: serde_json::Value },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ResponseBody {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// A live connection to the realtime model for exactly one call.
pub struct ModelSession {
    outbound: mpsc::UnboundedSender<Message>,
}

impl ModelSession {
    /// Open the web-socket, configure the session, and spawn the read-loop
    /// task that turns server events into `ModelEvent`s on `events`.
    /// Rejects if the connection isn't established within 10s (§5).
    pub async fn connect(
        config: ModelSessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ModelEvent>), String> {
        let url = format!("{REALTIME_API_URL}?model={}&temperature={}", config.model, config.temperature);
        let request = Request::builder()
            .uri(&url)
            .header("Host", "api.openai.com")
            .header("Authorization", format!("Bearer {}", config.api_key))
            .header("OpenAI-Beta", "realtime=v1")
            .header("Sec-WebSocket-Key", tokio_tungstenite::tungstenite::handshake::client::generate_key())
            .header("Sec-WebSocket-Version", "13")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .body(())
            .map_err(|e| format!("failed to build model request: {e}"))?;

        let connect = tokio_tungstenite::connect_async(request);
        let (stream, _) = tokio::time::timeout(
            Duration::from_millis(crate::constants::MODEL_CONNECT_TIMEOUT_MS),
            connect,
        )
        .await
        .map_err(|_| "model web-socket connect timed out".to_string())?
        .map_err(|e| format!("model web-socket connect failed: {e}"))?;

        let (mut write, mut read) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<ModelEvent>();

        // Writer task: serializes everything onto the socket, including the
        // delayed session.update and greeting messages queued below.
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if write.send(message).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: the only place server events are dispatched. It holds
        // its own handle to the outbound channel so it can ack function
        // calls inline with dispatch.
        let reader_tx = event_tx.clone();
        let reader_outbound = outbound_tx.clone();
        tokio::spawn(async move {
            let mut pending_input_transcript: HashMap<String, String> = HashMap::new();
            while let Some(message) = read.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("model session read error: {e}");
                        break;
                    }
                };
                let event: ServerEvent = match serde_json::from_str(&text) {
                    Ok(e) => e,
                    Err(e) => {
                        debug!("unrecognized model event ({e}): {text}");
                        continue;
                    }
                };
                handle_server_event(event, &mut pending_input_transcript, &reader_tx, &reader_outbound);
            }
        });

        let session = Self { outbound: outbound_tx.clone() };

        // session.update is sent after a short settle delay (§4.4), not
        // immediately on open.
        let session_config = serde_json::json!({
            "modalities": ["text", "audio"],
            "input_audio_format": "pcmu",
            "output_audio_format": "pcmu",
            "turn_detection": {
                "type": "semantic_vad",
                "interrupt_response": true,
            },
            "input_audio_transcription": { "model": TRANSCRIPTION_MODEL },
            "instructions": config.instructions(),
            "tools": tool_defs(),
        });
        let greeting = config.initial_greeting.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(MODEL_SESSION_UPDATE_DELAY_MS)).await;
            let update = ClientEvent::SessionUpdate { session: session_config };
            if send(&outbound_tx, &update).is_err() {
                return;
            }
            if let Some(greeting) = greeting {
                let directive = format!(
                    "[SYSTEM: The call has just connected. Say exactly: \"{greeting}\"]"
                );
                let item = ClientEvent::ItemCreate {
                    item: serde_json::json!({
                        "type": "message",
                        "role": "user",
                        "content": [{ "type": "input_text", "text": directive }],
                    }),
                };
                let _ = send(&outbound_tx, &item);
                tokio::time::sleep(Duration::from_millis(MODEL_GREETING_DELAY_MS)).await;
                let _ = send(&outbound_tx, &ClientEvent::ResponseCreate);
            }
        });

        Ok((session, event_rx))
    }

    /// No-op until connected (by construction `ModelSession` only exists
    /// once the socket is open); base64-encodes and appends the frame.
    pub fn send_audio(&self, bytes: &[u8]) -> Result<(), String> {
        let audio = base64::engine::general_purpose::STANDARD.encode(bytes);
        send(&self.outbound, &ClientEvent::AudioAppend { audio })
    }
}

fn send(outbound: &mpsc::UnboundedSender<Message>, event: &ClientEvent) -> Result<(), String> {
    let json = serde_json::to_string(event).map_err(|e| format!("failed to encode model event: {e}"))?;
    outbound
        .send(Message::Text(json))
        .map_err(|_| "model session writer task has exited".to_string())
}

fn ack_function_call(outbound: &mpsc::UnboundedSender<Message>, call_id: &str) {
    let item = ClientEvent::ItemCreate {
        item: serde_json::json!({
            "type": "function_call_output",
            "call_id": call_id,
            "output": "ok",
        }),
    };
    let _ = send(outbound, &item);
}

/// Dispatch exactly one server event. Function calls are only ever acted on
/// from within `ResponseDone` (§4.4's duplicate-firing safety note) — never
/// from an intermediate `function_call_arguments.done` or `output_item.done`.
fn handle_server_event(
    event: ServerEvent,
    pending_input_transcript: &mut HashMap<String, String>,
    tx: &mpsc::UnboundedSender<ModelEvent>,
    outbound: &mpsc::UnboundedSender<Message>,
) {
    match event {
        ServerEvent::SessionUpdated {} => {
            info!("model session configured");
        }
        ServerEvent::SpeechStarted {} => {
            let _ = tx.send(ModelEvent::SpeechStart);
        }
        ServerEvent::AudioDelta { delta } => {
            match base64::engine::general_purpose::STANDARD.decode(&delta) {
                Ok(bytes) => {
                    let _ = tx.send(ModelEvent::AudioOutput(bytes));
                }
                Err(e) => warn!("failed to decode model audio delta: {e}"),
            }
        }
        ServerEvent::AssistantTranscriptDone { transcript } => {
            let _ = tx.send(ModelEvent::AssistantTranscript(transcript));
        }
        ServerEvent::InputTranscriptDelta { item_id, delta } => {
            pending_input_transcript.entry(item_id).or_default().push_str(&delta);
        }
        ServerEvent::InputTranscriptCompleted { item_id, transcript } => {
            let accumulated = pending_input_transcript.remove(&item_id);
            let text = transcript.or(accumulated).unwrap_or_default();
            if !text.is_empty() {
                let _ = tx.send(ModelEvent::UserTranscript(text));
            }
        }
        ServerEvent::ResponseDone { response } => {
            // Dispatched here only — see the doc comment above.
            for item in response.output {
                if item.kind != "function_call" {
                    continue;
                }
                let (Some(name), Some(call_id)) = (item.name, item.call_id) else { continue };
                let args: serde_json::Value = item
                    .arguments
                    .as_deref()
                    .and_then(|raw| serde_json::from_str(raw).ok())
                    .unwrap_or(serde_json::Value::Null);

                match name.as_str() {
                    "hangup" => {
                        let reason = args
                            .get("reason")
                            .and_then(|v| v.as_str())
                            .unwrap_or("goal achieved")
                            .to_string();
                        let _ = tx.send(ModelEvent::HangupRequested(reason));
                    }
                    "send_dtmf" => {
                        let digits = args.get("digits").and_then(|v| v.as_str()).unwrap_or("").to_string();
                        let _ = tx.send(ModelEvent::DtmfRequested(digits));
                    }
                    other => warn!("model requested unknown tool {other}"),
                }
                ack_function_call(outbound, &call_id);
            }
            let _ = tx.send(ModelEvent::ResponseDone);
        }
        ServerEvent::Error { error } => {
            error!("model session error: {error}");
        }
        ServerEvent::Unknown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instructions_include_date_rubric_and_persona() {
        let config = ModelSessionConfig::new("key".to_string(), "You are Alex, confirm the 2pm slot.".to_string());
        let instructions = config.instructions();
        assert!(instructions.contains("Today's date is"));
        assert!(instructions.contains("navigating a phone call"));
        assert!(instructions.contains("confirm the 2pm slot"));
    }

    #[test]
    fn tool_defs_declare_hangup_and_send_dtmf() {
        let tools = tool_defs();
        let names: Vec<&str> = tools.iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["hangup", "send_dtmf"]);
    }

    #[test]
    fn response_done_dispatches_function_call_exactly_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let mut pending = HashMap::new();
        let event = ServerEvent::ResponseDone {
            response: ResponseBody {
                output: vec![OutputItem {
                    kind: "function_call".to_string(),
                    call_id: Some("call_1".to_string()),
                    name: Some("hangup".to_string()),
                    arguments: Some("{\"reason\":\"goal achieved\"}".to_string()),
                }],
            },
        };
        handle_server_event(event, &mut pending, &tx, &outbound_tx);

        let received = rx.try_recv().unwrap();
        assert!(matches!(received, ModelEvent::HangupRequested(reason) if reason == "goal achieved"));
        assert!(matches!(rx.try_recv().unwrap(), ModelEvent::ResponseDone));
        assert!(rx.try_recv().is_err());

        // Exactly one ack was written to the model socket for the one call.
        let acked = outbound_rx.try_recv().unwrap();
        match acked {
            Message::Text(json) => assert!(json.contains("call_1")),
            other => panic!("expected text ack, got {other:?}"),
        }
        assert!(outbound_rx.try_recv().is_err());
    }

    #[test]
    fn input_transcription_deltas_accumulate_until_completed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let mut pending = HashMap::new();

        handle_server_event(
            ServerEvent::InputTranscriptDelta { item_id: "i1".to_string(), delta: "hel".to_string() },
            &mut pending,
            &tx,
            &outbound_tx,
        );
        handle_server_event(
            ServerEvent::InputTranscriptDelta { item_id: "i1".to_string(), delta: "lo".to_string() },
            &mut pending,
            &tx,
            &outbound_tx,
        );
        assert!(rx.try_recv().is_err());

        handle_server_event(
            ServerEvent::InputTranscriptCompleted { item_id: "i1".to_string(), transcript: None },
            &mut pending,
            &tx,
            &outbound_tx,
        );
        match rx.try_recv().unwrap() {
            ModelEvent::UserTranscript(text) => assert_eq!(text, "hello"),
            other => panic!("expected UserTranscript, got {other:?}"),
        }
        assert!(!pending.contains_key("i1"));
    }
}
