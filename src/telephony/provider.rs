//! Carrier adapter contract: the four operations every provider implements,
//! plus the normalized event shape C6 consumes.

use crate::telephony::webhook::VerifyContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedEvent {
    Initiated { call_id: String, event_id: String, provider_call_id: Option<String> },
    Ringing { call_id: String, event_id: String, provider_call_id: Option<String> },
    Answered { call_id: String, event_id: String, provider_call_id: Option<String> },
    Ended { call_id: String, event_id: String, reason: String, provider_call_id: Option<String> },
    Speech { call_id: String, event_id: String, text: String, provider_call_id: Option<String> },
    Dtmf { call_id: String, event_id: String, digits: String, provider_call_id: Option<String> },
}

impl NormalizedEvent {
    pub fn call_id(&self) -> &str {
        match self {
            NormalizedEvent::Initiated { call_id, .. }
            | NormalizedEvent::Ringing { call_id, .. }
            | NormalizedEvent::Answered { call_id, .. }
            | NormalizedEvent::Ended { call_id, .. }
            | NormalizedEvent::Speech { call_id, .. }
            | NormalizedEvent::Dtmf { call_id, .. } => call_id,
        }
    }

    pub fn event_id(&self) -> &str {
        match self {
            NormalizedEvent::Initiated { event_id, .. }
            | NormalizedEvent::Ringing { event_id, .. }
            | NormalizedEvent::Answered { event_id, .. }
            | NormalizedEvent::Ended { event_id, .. }
            | NormalizedEvent::Speech { event_id, .. }
            | NormalizedEvent::Dtmf { event_id, .. } => event_id,
        }
    }

    /// The carrier's own id for this call, independent of whether `call_id`
    /// resolved through the internal id or the reverse index. `None` when
    /// the provider never surfaced one (e.g. the mock provider's synthetic
    /// default). Used by `CallManager` to rebind its reverse index (§3
    /// invariant 6, §4.6) without depending on which id `call_id` happened
    /// to carry for a given delivery.
    pub fn provider_call_id(&self) -> Option<&str> {
        match self {
            NormalizedEvent::Initiated { provider_call_id, .. }
            | NormalizedEvent::Ringing { provider_call_id, .. }
            | NormalizedEvent::Answered { provider_call_id, .. }
            | NormalizedEvent::Ended { provider_call_id, .. }
            | NormalizedEvent::Speech { provider_call_id, .. }
            | NormalizedEvent::Dtmf { provider_call_id, .. } => provider_call_id.as_deref(),
        }
    }
}

/// A parsed webhook request: the normalized events it produced, plus the
/// control-document response body the carrier expects back.
#[derive(Debug, Clone)]
pub struct ParsedWebhook {
    pub events: Vec<NormalizedEvent>,
    pub response_body: String,
    pub response_content_type: &'static str,
}

#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub verify_ctx: VerifyContext,
    pub signature: Option<String>,
    pub query: std::collections::BTreeMap<String, String>,
    pub is_status_callback: bool,
}

#[derive(Debug, Clone)]
pub struct InitiateCallParams {
    pub call_id: String,
    pub from: String,
    pub to: String,
    pub webhook_url: String,
}

/// Narrow contract every carrier implementation satisfies. `CallManager`
/// depends only on this trait, never on a concrete provider.
#[async_trait]
pub trait CallProvider: Send + Sync {
    fn verify_webhook(&self, req: &WebhookRequest) -> bool;

    fn parse_webhook_event(
        &self,
        req: &WebhookRequest,
        public_origin: &str,
        stream_path: &str,
    ) -> Result<ParsedWebhook, String>;

    async fn initiate_call(&self, params: InitiateCallParams) -> Result<String, String>;

    async fn hangup_call(&self, provider_call_id: &str) -> Result<(), String>;
}
