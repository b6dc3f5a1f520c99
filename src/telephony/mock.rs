//! Test-only carrier: mints synthetic provider call ids, accepts any
//! webhook, never makes a network call.

use crate::telephony::provider::{
    CallProvider, InitiateCallParams, NormalizedEvent, ParsedWebhook, WebhookRequest,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct MockProvider {
    counter: AtomicU64,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallProvider for MockProvider {
    fn verify_webhook(&self, _req: &WebhookRequest) -> bool {
        true
    }

    fn parse_webhook_event(
        &self,
        req: &WebhookRequest,
        public_origin: &str,
        stream_path: &str,
    ) -> Result<ParsedWebhook, String> {
        let provider_call_id = req.verify_ctx.form_body.get("CallSid").cloned();
        let call_id = req
            .query
            .get("callId")
            .cloned()
            .or_else(|| provider_call_id.clone())
            .unwrap_or_else(|| "mock-call".to_string());
        let event_id = req
            .verify_ctx
            .form_body
            .get("EventId")
            .cloned()
            .unwrap_or_else(|| "mock-event".to_string());

        let events = match req.verify_ctx.form_body.get("CallStatus").map(String::as_str) {
            Some("ringing") => {
                vec![NormalizedEvent::Ringing { call_id, event_id, provider_call_id }]
            }
            Some("in-progress") => {
                vec![NormalizedEvent::Answered { call_id, event_id, provider_call_id }]
            }
            Some(status @ ("completed" | "busy" | "no-answer" | "failed")) => {
                vec![NormalizedEvent::Ended {
                    call_id,
                    event_id,
                    reason: status.to_string(),
                    provider_call_id,
                }]
            }
            _ => vec![NormalizedEvent::Initiated { call_id, event_id, provider_call_id }],
        };

        Ok(ParsedWebhook {
            events,
            response_body: format!(
                "<Response><Connect><Stream url=\"wss://{public_origin}{stream_path}\"/></Connect></Response>"
            ),
            response_content_type: "text/xml",
        })
    }

    async fn initiate_call(&self, _params: InitiateCallParams) -> Result<String, String> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(format!("MOCK-CALL-{n}"))
    }

    async fn hangup_call(&self, _provider_call_id: &str) -> Result<(), String> {
        Ok(())
    }
}
