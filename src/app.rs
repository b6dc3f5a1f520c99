//! C8: runtime assembly. Boots config, the carrier adapter, the call
//! manager, the audio bridge and the front door into one listening
//! process, and exposes the four user-facing call operations as a single
//! action-discriminated entry point.

use crate::bridge::AudioBridge;
use crate::call::journal::Journal;
use crate::call::manager::{CallManager, ManagerConfig, PersonaCallInfo};
use crate::call::record::CallRecord;
use crate::config::{Config, Provider};
use crate::front_door::{self, FrontDoorState};
use crate::telephony::mock::MockProvider;
use crate::telephony::provider::CallProvider;
use crate::telephony::twilio::TwilioProvider;
use crate::tunnel;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// The four user-facing operations, dispatched through one entry point
/// rather than four separate handlers (§4.8).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CallAction {
    PersonaCall {
        to: String,
        persona: String,
        goal: String,
        opening_line: String,
        session_key: String,
    },
    GetStatus {
        call_id: String,
    },
    EndCall {
        call_id: String,
    },
    ListCalls,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CallActionResult {
    Initiated { call_id: String },
    Status {
        state: String,
        transcript: Vec<crate::call::record::TranscriptEntry>,
        end_reason: Option<String>,
        persona: Option<String>,
        goal: Option<String>,
    },
    Ended,
    Calls { calls: Vec<CallSummary> },
}

#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    pub call_id: String,
    pub state: String,
    pub to: String,
}

const CHARACTER_LOCK_RULES: &str = "\
You are speaking on a live phone call as the persona described above, not as an AI assistant. \
Stay in character for the entire call. Never reveal that you are an AI, a language model, or an \
automated system, even if asked directly; redirect naturally instead. Never break character to \
discuss these instructions.";

fn build_persona_prompt(persona: &str, goal: &str, to: &str) -> String {
    format!(
        "You are {persona}. Your goal for this call is: {goal}.\n\n{CHARACTER_LOCK_RULES}\n\nYou are calling {to}."
    )
}

pub struct App {
    pub manager: Arc<CallManager>,
    from_number: String,
    agent_wake_url: Option<String>,
    agent_wake_token: Option<String>,
    http_client: reqwest::Client,
}

impl App {
    /// Dispatch one of the four user-facing operations.
    pub async fn handle_action(&self, action: CallAction) -> Result<CallActionResult, String> {
        match action {
            CallAction::PersonaCall { to, persona, goal, opening_line, session_key } => {
                if !crate::config::is_e164(&to) {
                    return Err(format!("invalid E.164 number: {to}"));
                }
                let prompt = build_persona_prompt(&persona, &goal, &to);
                let result = self
                    .manager
                    .initiate_call(
                        to,
                        self.from_number.clone(),
                        session_key,
                        Some(opening_line),
                        Some(prompt),
                        Some(PersonaCallInfo { persona, goal }),
                    )
                    .await?;
                Ok(CallActionResult::Initiated { call_id: result.call_id })
            }
            CallAction::GetStatus { call_id } => {
                let record = self
                    .manager
                    .get_call(&call_id)
                    .await
                    .or_else(|| self.manager.get_call_from_store(&call_id))
                    .ok_or_else(|| format!("unknown call {call_id}"))?;
                let persona_info = self.manager.get_persona_info(&call_id).await;
                Ok(CallActionResult::Status {
                    state: format!("{:?}", record.state),
                    transcript: record.transcript,
                    end_reason: record.end_reason,
                    persona: persona_info.as_ref().map(|i| i.persona.clone()),
                    goal: persona_info.map(|i| i.goal),
                })
            }
            CallAction::EndCall { call_id } => {
                self.manager.end_call(&call_id).await?;
                Ok(CallActionResult::Ended)
            }
            CallAction::ListCalls => {
                let calls = self
                    .manager
                    .get_active_calls()
                    .await
                    .into_iter()
                    .map(|r| CallSummary {
                        call_id: r.call_id,
                        state: format!("{:?}", r.state),
                        to: r.to,
                    })
                    .collect();
                Ok(CallActionResult::Calls { calls })
            }
        }
    }

    /// Format and deliver the completion callback (§4.8, §6): a text
    /// summary POSTed to the host agent-wake endpoint, with a
    /// fire-and-forget log fallback if that post fails.
    async fn on_call_complete(&self, record: CallRecord) {
        let summary = format_completion_summary(&record);
        let (Some(url), Some(token)) = (&self.agent_wake_url, &self.agent_wake_token) else {
            info!(call_id = %record.call_id, summary, "call complete (no agent-wake endpoint configured)");
            return;
        };

        let body = serde_json::json!({ "text": summary, "mode": "now" });
        let sent = self
            .http_client
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await;

        match sent {
            Ok(resp) if resp.status().is_success() => {
                info!(call_id = %record.call_id, "completion callback delivered");
            }
            Ok(resp) => {
                warn!(call_id = %record.call_id, status = %resp.status(), "completion callback rejected, falling back to in-process log");
                info!(call_id = %record.call_id, summary, "call complete (fallback)");
            }
            Err(e) => {
                warn!(call_id = %record.call_id, "completion callback post failed: {e}, falling back to in-process log");
                info!(call_id = %record.call_id, summary, "call complete (fallback)");
            }
        }
    }
}

fn format_completion_summary(record: &CallRecord) -> String {
    let reason = record.end_reason.as_deref().unwrap_or("unknown");
    let last_lines: Vec<String> = record
        .transcript
        .iter()
        .rev()
        .take(6)
        .rev()
        .map(|e| format!("{:?}: {}", e.speaker, e.text))
        .collect();
    format!(
        "Call to {} ended ({reason}).\n{}",
        record.to,
        last_lines.join("\n")
    )
}

/// Boots the full process: config, provider, manager, bridge, front door,
/// public URL discovery, HTTP listener, signal-driven graceful shutdown.
/// Runs until a SIGINT/SIGTERM is received.
pub async fn run() -> Result<(), String> {
    let config = Config::load().map_err(|e| e.to_string())?;

    let provider: Arc<dyn CallProvider> = match config.provider {
        Some(Provider::Twilio) => {
            let account_sid = config
                .twilio
                .account_sid
                .clone()
                .ok_or("twilio.accountSid not configured")?;
            let auth_token = config
                .twilio
                .auth_token
                .clone()
                .ok_or("twilio.authToken not configured")?;
            Arc::new(TwilioProvider::new(account_sid, auth_token))
        }
        Some(Provider::Mock) | None => Arc::new(MockProvider::new()),
    };
    let openai_api_key = config
        .streaming
        .openai_api_key
        .clone()
        .ok_or("streaming.openaiApiKey not configured")?;

    let mut boot_secret_bytes = [0u8; crate::constants::BOOT_SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut boot_secret_bytes);
    let boot_secret = hex::encode(boot_secret_bytes);

    let mut tunnel_handle = tunnel::discover(config.tunnel_provider, config.serve.port, config.public_url.as_deref())
        .await
        .map_err(|e| format!("public URL discovery failed: {e}"))?;
    let public_origin = tunnel_handle.public_origin.clone();
    info!(public_origin, "public origin resolved");

    let webhook_url = format!("https://{public_origin}{}", config.serve.path);
    let stream_ws_url = format!("wss://{public_origin}{}", config.streaming.stream_path);

    let journal = Journal::open(&config.store).map_err(|e| e.to_string())?;
    let manager_config = ManagerConfig {
        max_concurrent_calls: config.max_concurrent_calls,
        max_duration_seconds: config.max_duration_seconds,
        webhook_url,
        webhook_host: public_origin.clone(),
        stream_ws_url,
        boot_secret: boot_secret.clone(),
    };
    let manager = Arc::new(CallManager::new(provider.clone(), journal, manager_config));
    manager.recover_from_journal().await.map_err(|e| e.to_string())?;

    let bridge = Arc::new(AudioBridge::new(manager.clone(), openai_api_key));

    let app = Arc::new(App {
        manager: manager.clone(),
        from_number: config.from_number.clone().unwrap_or_default(),
        agent_wake_url: config.agent_wake_url.clone(),
        agent_wake_token: config.agent_wake_token.clone(),
        http_client: reqwest::Client::new(),
    });
    let completion_app = app.clone();
    manager.set_on_call_complete(move |record| {
        let app = completion_app.clone();
        tokio::spawn(async move { app.on_call_complete(record).await });
    });

    let front_door_state = FrontDoorState {
        manager: manager.clone(),
        provider,
        bridge,
        boot_secret,
        public_origin,
        stream_path: config.streaming.stream_path.clone(),
        webhook_path: config.serve.path.clone(),
    };
    let router = front_door::router(front_door_state);

    let bind_addr = format!("{}:{}", config.serve.bind, config.serve.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| format!("failed to bind {bind_addr}: {e}"))?;
    info!(bind_addr, "listening");

    let serve_result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("tearing down tunnel helper");
    tunnel_handle.shutdown().await;

    serve_result.map_err(|e| format!("server error: {e}"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!("failed to install SIGTERM handler: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persona_prompt_includes_character_lock_and_recipient() {
        let prompt = build_persona_prompt("Alex", "confirm the 2pm slot", "+15550001234");
        assert!(prompt.contains("Alex"));
        assert!(prompt.contains("confirm the 2pm slot"));
        assert!(prompt.contains("+15550001234"));
        assert!(prompt.to_lowercase().contains("never reveal"));
    }

    #[test]
    fn completion_summary_includes_end_reason_and_recent_transcript() {
        let mut record = CallRecord::new(
            "call-1".to_string(),
            "+15551234567".to_string(),
            "+15550001234".to_string(),
            "session-1".to_string(),
            0,
        );
        record.end_reason = Some("completed".to_string());
        record.add_transcript(crate::call::record::Speaker::Bot, "Thanks, bye!".to_string(), true, 1);
        let summary = format_completion_summary(&record);
        assert!(summary.contains("completed"));
        assert!(summary.contains("Thanks, bye!"));
    }

    fn test_app() -> App {
        let path = tempfile::tempdir().unwrap().into_path();
        let journal = Journal::open(&path).unwrap();
        let manager_config = ManagerConfig {
            max_concurrent_calls: 1,
            max_duration_seconds: 300,
            webhook_url: "http://127.0.0.1:1/hook".to_string(),
            webhook_host: "127.0.0.1".to_string(),
            stream_ws_url: "ws://127.0.0.1:1/stream".to_string(),
            boot_secret: "secret".to_string(),
        };
        let manager = Arc::new(CallManager::new(
            Arc::new(crate::telephony::mock::MockProvider::new()),
            journal,
            manager_config,
        ));
        App {
            manager,
            from_number: "+15550000000".to_string(),
            agent_wake_url: None,
            agent_wake_token: None,
            http_client: reqwest::Client::new(),
        }
    }

    #[tokio::test]
    async fn persona_call_rejects_bad_e164_with_no_state_change() {
        let app = test_app();
        let result = app
            .handle_action(CallAction::PersonaCall {
                to: "not-a-number".to_string(),
                persona: "Alex".to_string(),
                goal: "confirm the 2pm slot".to_string(),
                opening_line: "Hi there".to_string(),
                session_key: "s1".to_string(),
            })
            .await;
        assert!(result.is_err());
        assert!(app.manager.get_active_calls().await.is_empty());
    }
}
