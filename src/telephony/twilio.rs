//! Real carrier adapter: places calls and parses status webhooks via the
//! Twilio REST API.

use crate::constants::TWILIO_SIGNATURE_HEADER;
use crate::errors::ProviderError;
use crate::telephony::provider::{
    CallProvider, InitiateCallParams, NormalizedEvent, ParsedWebhook, WebhookRequest,
};
use crate::telephony::webhook::verify;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

pub struct TwilioProvider {
    account_sid: String,
    auth_token: String,
    client: reqwest::Client,
}

impl TwilioProvider {
    pub fn new(account_sid: String, auth_token: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build Twilio HTTP client");
        Self {
            account_sid,
            auth_token,
            client,
        }
    }

    fn base_url(&self) -> String {
        format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Calls",
            self.account_sid
        )
    }
}

fn status_to_event(
    status: &str,
    call_id: &str,
    event_id: &str,
    provider_call_id: Option<&str>,
) -> Option<NormalizedEvent> {
    let provider_call_id = provider_call_id.map(str::to_string);
    match status {
        "initiated" => Some(NormalizedEvent::Initiated {
            call_id: call_id.to_string(),
            event_id: event_id.to_string(),
            provider_call_id,
        }),
        "ringing" => Some(NormalizedEvent::Ringing {
            call_id: call_id.to_string(),
            event_id: event_id.to_string(),
            provider_call_id,
        }),
        "in-progress" => Some(NormalizedEvent::Answered {
            call_id: call_id.to_string(),
            event_id: event_id.to_string(),
            provider_call_id,
        }),
        "completed" | "busy" | "no-answer" | "failed" => Some(NormalizedEvent::Ended {
            call_id: call_id.to_string(),
            event_id: event_id.to_string(),
            reason: status.to_string(),
            provider_call_id,
        }),
        "canceled" => Some(NormalizedEvent::Ended {
            call_id: call_id.to_string(),
            event_id: event_id.to_string(),
            reason: "hangup-bot".to_string(),
            provider_call_id,
        }),
        _ => None,
    }
}

#[async_trait]
impl CallProvider for TwilioProvider {
    fn verify_webhook(&self, req: &WebhookRequest) -> bool {
        let outcome = verify(
            &req.verify_ctx,
            req.signature.as_deref(),
            &self.auth_token,
            None,
        );
        outcome.ok
    }

    fn parse_webhook_event(
        &self,
        req: &WebhookRequest,
        public_origin: &str,
        stream_path: &str,
    ) -> Result<ParsedWebhook, String> {
        let body = &req.verify_ctx.form_body;
        let call_id = req
            .query
            .get("callId")
            .cloned()
            .or_else(|| body.get("CallSid").cloned())
            .ok_or_else(|| "webhook body missing callId and CallSid".to_string())?;

        // Twilio doesn't mint a webhook-level event id; derive a stable one
        // from the fields that actually vary between deliveries so retries
        // of the exact same delivery collide (and get dropped by C6).
        let event_id = format!(
            "{}:{}:{}:{}",
            call_id,
            body.get("CallStatus").map(String::as_str).unwrap_or(""),
            body.get("SpeechResult").map(String::as_str).unwrap_or(""),
            body.get("Digits").map(String::as_str).unwrap_or(""),
        );

        // Twilio's own call id. Carried on every event regardless of whether
        // `call_id` above resolved through the `callId` query param or this
        // same CallSid, so the manager can always rebind its reverse index
        // to it even when query routing took priority for `call_id` itself.
        let provider_call_id = body.get("CallSid").map(String::as_str);

        let mut events = Vec::new();
        if let Some(status) = body.get("CallStatus") {
            if let Some(event) = status_to_event(status, &call_id, &event_id, provider_call_id) {
                events.push(event);
            }
        }
        if let Some(speech) = body.get("SpeechResult") {
            events.push(NormalizedEvent::Speech {
                call_id: call_id.clone(),
                event_id: event_id.clone(),
                text: speech.clone(),
                provider_call_id: provider_call_id.map(str::to_string),
            });
        }
        if let Some(digits) = body.get("Digits") {
            events.push(NormalizedEvent::Dtmf {
                call_id: call_id.clone(),
                event_id: event_id.clone(),
                digits: digits.clone(),
                provider_call_id: provider_call_id.map(str::to_string),
            });
        }

        let in_progress = body.get("CallStatus").map(String::as_str) == Some("in-progress");
        let response_body = if req.is_status_callback {
            String::new()
        } else if in_progress || !req.is_status_callback {
            format!(
                "<Response><Connect><Stream url=\"wss://{public_origin}{stream_path}\"/></Connect></Response>"
            )
        } else {
            "<Response><Pause length=\"30\"/></Response>".to_string()
        };

        Ok(ParsedWebhook {
            events,
            response_body,
            response_content_type: "text/xml",
        })
    }

    async fn initiate_call(&self, params: InitiateCallParams) -> Result<String, String> {
        let webhook_url = format!("{}?callId={}", params.webhook_url, params.call_id);
        let status_callback = format!(
            "{}?callId={}&type=status",
            params.webhook_url, params.call_id
        );

        let mut form: BTreeMap<&str, String> = BTreeMap::new();
        form.insert("To", params.to);
        form.insert("From", params.from);
        form.insert("Url", webhook_url);
        form.insert("StatusCallback", status_callback);
        form.insert(
            "StatusCallbackEvent",
            "initiated ringing answered completed".to_string(),
        );
        form.insert("Record", "true".to_string());
        form.insert("RecordingChannels", "dual".to_string());
        form.insert("Timeout", "30".to_string());

        let response = self
            .client
            .post(self.base_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()).to_string())?;

        if !response.status().is_success() {
            let status = response.status();
            let err = if status == reqwest::StatusCode::UNAUTHORIZED {
                ProviderError::Unauthorized
            } else {
                ProviderError::Http(status.as_u16())
            };
            let body = response.text().await.unwrap_or_default();
            return Err(format!("{err}: {body}"));
        }

        let created: TwilioCallResource = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()).to_string())?;
        Ok(created.sid)
    }

    async fn hangup_call(&self, provider_call_id: &str) -> Result<(), String> {
        let url = format!("{}/{}", self.base_url(), provider_call_id);
        let mut form = BTreeMap::new();
        form.insert("Status", "completed");

        let response = self
            .client
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()).to_string())?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !response.status().is_success() {
            let status = response.status();
            let err = if status == reqwest::StatusCode::UNAUTHORIZED {
                ProviderError::Unauthorized
            } else {
                ProviderError::Http(status.as_u16())
            };
            let body = response.text().await.unwrap_or_default();
            return Err(format!("{err}: {body}"));
        }
        Ok(())
    }
}

#[derive(serde::Deserialize)]
struct TwilioCallResource {
    sid: String,
}

pub const SIGNATURE_HEADER: &str = TWILIO_SIGNATURE_HEADER;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telephony::webhook::VerifyContext;

    fn webhook_request(body: &[(&str, &str)], query: &[(&str, &str)]) -> WebhookRequest {
        WebhookRequest {
            verify_ctx: VerifyContext {
                headers: BTreeMap::new(),
                request_path_and_query: "/voice/webhook".to_string(),
                form_body: body.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            },
            signature: None,
            query: query.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            is_status_callback: false,
        }
    }

    fn provider() -> TwilioProvider {
        TwilioProvider::new("ACxxx".to_string(), "token".to_string())
    }

    #[test]
    fn maps_call_status_to_normalized_events() {
        let req = webhook_request(&[("CallSid", "CA1"), ("CallStatus", "ringing")], &[]);
        let parsed = provider()
            .parse_webhook_event(&req, "example.com", "/voice/stream")
            .unwrap();
        assert_eq!(parsed.events.len(), 1);
        assert!(matches!(parsed.events[0], NormalizedEvent::Ringing { .. }));
    }

    #[test]
    fn in_progress_response_connects_media_stream() {
        let req = webhook_request(&[("CallSid", "CA1"), ("CallStatus", "in-progress")], &[]);
        let parsed = provider()
            .parse_webhook_event(&req, "example.com", "/voice/stream")
            .unwrap();
        assert!(parsed.response_body.contains("<Connect>"));
        assert!(parsed.response_body.contains("wss://example.com/voice/stream"));
    }

    #[test]
    fn status_callback_yields_empty_body() {
        let mut req = webhook_request(&[("CallSid", "CA1"), ("CallStatus", "completed")], &[]);
        req.is_status_callback = true;
        let parsed = provider()
            .parse_webhook_event(&req, "example.com", "/voice/stream")
            .unwrap();
        assert_eq!(parsed.response_body, "");
    }

    #[test]
    fn canceled_maps_to_hangup_bot_reason() {
        let req = webhook_request(&[("CallSid", "CA1"), ("CallStatus", "canceled")], &[]);
        let parsed = provider()
            .parse_webhook_event(&req, "example.com", "/voice/stream")
            .unwrap();
        match &parsed.events[0] {
            NormalizedEvent::Ended { reason, .. } => assert_eq!(reason, "hangup-bot"),
            other => panic!("expected Ended, got {other:?}"),
        }
    }

    #[test]
    fn query_call_id_takes_priority_over_call_sid() {
        let req = webhook_request(
            &[("CallSid", "CA-wrong"), ("CallStatus", "ringing")],
            &[("callId", "internal-id")],
        );
        let parsed = provider()
            .parse_webhook_event(&req, "example.com", "/voice/stream")
            .unwrap();
        assert_eq!(parsed.events[0].call_id(), "internal-id");
    }
}
