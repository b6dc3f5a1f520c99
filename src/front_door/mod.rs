//! C7: the HTTP + web-socket listener. Routes signed webhooks to the
//! carrier adapter (C3) and media-stream upgrades to the audio bridge
//! (C5); serves the internal self-test and health-check endpoints.

use crate::bridge::AudioBridge;
use crate::call::manager::CallManager;
use crate::constants::SELF_TEST_HEADER;
use crate::telephony::provider::{CallProvider, WebhookRequest};
use crate::telephony::webhook::VerifyContext;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct FrontDoorState {
    pub manager: Arc<CallManager>,
    pub provider: Arc<dyn CallProvider>,
    pub bridge: Arc<AudioBridge>,
    pub boot_secret: String,
    pub public_origin: String,
    pub stream_path: String,
    pub webhook_path: String,
}

pub fn router(state: FrontDoorState) -> Router {
    let webhook_path = state.webhook_path.clone();
    let stream_path = state.stream_path.clone();
    Router::new()
        .route("/health", get(health))
        .route(&webhook_path, post(webhook))
        .route(&stream_path, get(stream_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn webhook(
    State(state): State<FrontDoorState>,
    headers: HeaderMap,
    Query(query): Query<BTreeMap<String, String>>,
    body: String,
) -> Response {
    if let Some(self_test) = headers.get(SELF_TEST_HEADER).and_then(|v| v.to_str().ok()) {
        if self_test == state.boot_secret {
            return StatusCode::OK.into_response();
        }
        // A mismatched self-test token is not special-cased further; it
        // must still pass HMAC verification like any other request (§7).
    }

    let form_body: BTreeMap<String, String> = form_urlencoded::parse(body.as_bytes())
        .into_owned()
        .collect();
    let header_map: BTreeMap<String, String> = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    let path_and_query = request_path_and_query(&state, &query);

    let verify_ctx = VerifyContext {
        headers: header_map,
        request_path_and_query: path_and_query,
        form_body,
    };
    let signature = headers
        .get(crate::constants::TWILIO_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let is_status_callback = query.get("type").map(String::as_str) == Some("status");

    let request = WebhookRequest {
        verify_ctx,
        signature,
        query: query.clone(),
        is_status_callback,
    };

    if !state.provider.verify_webhook(&request) {
        warn!("webhook signature verification failed");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let parsed = match state
        .provider
        .parse_webhook_event(&request, &state.public_origin, &state.stream_path)
    {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("failed to parse webhook event: {e}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    for event in parsed.events {
        state.manager.process_event(event).await;
    }

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, parsed.response_content_type)],
        parsed.response_body,
    )
        .into_response()
}

/// Reconstructs the path+query exactly as the carrier received it, so C2's
/// signature check signs against the same string the carrier signed.
fn request_path_and_query(state: &FrontDoorState, query: &BTreeMap<String, String>) -> String {
    if query.is_empty() {
        return state.webhook_path.clone();
    }
    let pairs: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{}?{}", state.webhook_path, pairs.join("&"))
}

async fn stream_upgrade(State(state): State<FrontDoorState>, ws: WebSocketUpgrade) -> Response {
    info!("media-stream upgrade accepted");
    ws.on_upgrade(move |socket| async move {
        state.bridge.handle_socket(socket).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telephony::mock::MockProvider;

    fn state() -> FrontDoorState {
        FrontDoorState {
            manager: Arc::new(CallManager::new(
                Arc::new(MockProvider::new()),
                crate::call::journal::Journal::open(&std::env::temp_dir().join("supercall-test-front-door"))
                    .unwrap(),
                crate::call::manager::ManagerConfig {
                    max_concurrent_calls: 1,
                    max_duration_seconds: 300,
                    webhook_url: "https://example.com/voice/webhook".to_string(),
                    webhook_host: "example.com".to_string(),
                    stream_ws_url: "wss://example.com/voice/stream".to_string(),
                    boot_secret: "secret".to_string(),
                },
            )),
            provider: Arc::new(MockProvider::new()),
            bridge: Arc::new(AudioBridge::new(
                Arc::new(CallManager::new(
                    Arc::new(MockProvider::new()),
                    crate::call::journal::Journal::open(&std::env::temp_dir().join("supercall-test-front-door-2"))
                        .unwrap(),
                    crate::call::manager::ManagerConfig {
                        max_concurrent_calls: 1,
                        max_duration_seconds: 300,
                        webhook_url: "https://example.com/voice/webhook".to_string(),
                        webhook_host: "example.com".to_string(),
                        stream_ws_url: "wss://example.com/voice/stream".to_string(),
                        boot_secret: "secret".to_string(),
                    },
                )),
                "test-key".to_string(),
            )),
            boot_secret: "secret".to_string(),
            public_origin: "example.com".to_string(),
            stream_path: "/voice/stream".to_string(),
            webhook_path: "/voice/webhook".to_string(),
        }
    }

    #[test]
    fn path_without_query_is_bare_webhook_path() {
        let query = BTreeMap::new();
        assert_eq!(request_path_and_query(&state(), &query), "/voice/webhook");
    }

    #[test]
    fn path_with_query_appends_sorted_params() {
        let mut query = BTreeMap::new();
        query.insert("callId".to_string(), "abc".to_string());
        query.insert("type".to_string(), "status".to_string());
        assert_eq!(
            request_path_and_query(&state(), &query),
            "/voice/webhook?callId=abc&type=status"
        );
    }
}
