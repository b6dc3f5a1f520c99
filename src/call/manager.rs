//! Call manager (C6): owns the active call map, the reverse provider-id
//! index, concurrency limits, persistence, the max-duration timer and the
//! completion callback. The only component allowed to mutate a `CallRecord`.

use crate::call::journal::{recover_record, Journal, Recovered};
use crate::call::preflight::Preflight;
use crate::call::record::{CallRecord, CallState, Speaker};
use crate::constants::STALE_RECORD_MAX_AGE_SECONDS;
use crate::telephony::provider::{CallProvider, InitiateCallParams, NormalizedEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Default)]
pub struct PersonaCallInfo {
    pub persona: String,
    pub goal: String,
}

pub struct ManagerConfig {
    pub max_concurrent_calls: u32,
    pub max_duration_seconds: u64,
    pub webhook_url: String,
    pub webhook_host: String,
    pub stream_ws_url: String,
    pub boot_secret: String,
}

pub struct InitiateResult {
    pub call_id: String,
}

type CompletionHandler = Box<dyn Fn(CallRecord) + Send + Sync>;

pub struct CallManager {
    active: RwLock<HashMap<String, CallRecord>>,
    provider_index: RwLock<HashMap<String, String>>,
    persona_info: RwLock<HashMap<String, PersonaCallInfo>>,
    duration_timers: RwLock<HashMap<String, tokio::task::JoinHandle<()>>>,
    provider: Arc<dyn CallProvider>,
    journal: Journal,
    preflight: Preflight,
    config: ManagerConfig,
    on_complete: parking_lot::RwLock<Option<CompletionHandler>>,
}

impl CallManager {
    pub fn new(provider: Arc<dyn CallProvider>, journal: Journal, config: ManagerConfig) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            provider_index: RwLock::new(HashMap::new()),
            persona_info: RwLock::new(HashMap::new()),
            duration_timers: RwLock::new(HashMap::new()),
            provider,
            journal,
            preflight: Preflight::new(),
            config,
            on_complete: parking_lot::RwLock::new(None),
        }
    }

    pub fn set_on_call_complete(&self, handler: impl Fn(CallRecord) + Send + Sync + 'static) {
        *self.on_complete.write() = Some(Box::new(handler));
    }

    async fn fire_completion(&self, record: CallRecord) {
        let guard = self.on_complete.read();
        if let Some(handler) = guard.as_ref() {
            handler(record);
        }
    }

    /// Re-read the journal on startup: stale non-terminal records are
    /// rewritten as `error`; younger ones reload into the active map.
    pub async fn recover_from_journal(&self) -> std::io::Result<()> {
        let records = self.journal.read_all()?;
        let mut active = self.active.write().await;
        let mut index = self.provider_index.write().await;
        let now = now_ms();
        let stale_age_ms = STALE_RECORD_MAX_AGE_SECONDS * 1000;

        for (call_id, record) in records {
            match recover_record(record, now, stale_age_ms) {
                Recovered::Active(record) => {
                    if let Some(provider_call_id) = &record.provider_call_id {
                        index.insert(provider_call_id.clone(), call_id.clone());
                    }
                    active.insert(call_id, record);
                }
                Recovered::StaleRewritten(record) => {
                    self.journal.append(&record)?;
                    warn!(call_id = %record.call_id, "stale call record rewritten as error on startup");
                }
                Recovered::Skipped => {}
            }
        }
        Ok(())
    }

    pub async fn initiate_call(
        self: &Arc<Self>,
        to: String,
        from: String,
        session_key: String,
        initial_message: Option<String>,
        persona_prompt: Option<String>,
        persona_info: Option<PersonaCallInfo>,
    ) -> Result<InitiateResult, String> {
        self.preflight
            .check(
                now_ms(),
                &self.config.webhook_url,
                &self.config.webhook_host,
                &self.config.stream_ws_url,
                &self.config.boot_secret,
            )
            .await?;

        {
            let active = self.active.read().await;
            let non_terminal = active.values().filter(|r| !r.state.is_terminal()).count();
            if non_terminal >= self.config.max_concurrent_calls as usize {
                return Err(format!(
                    "max concurrent calls reached ({})",
                    self.config.max_concurrent_calls
                ));
            }
        }

        let call_id = Uuid::new_v4().to_string();
        let mut record = CallRecord::new(call_id.clone(), from.clone(), to.clone(), session_key, now_ms());
        if let Some(message) = &initial_message {
            record
                .metadata
                .insert("initialMessage".to_string(), serde_json::Value::String(message.clone()));
        }
        if let Some(prompt) = &persona_prompt {
            record
                .metadata
                .insert("personaPrompt".to_string(), serde_json::Value::String(prompt.clone()));
        }

        self.journal.append(&record).map_err(|e| e.to_string())?;
        {
            let mut active = self.active.write().await;
            active.insert(call_id.clone(), record.clone());
        }
        if let Some(info) = persona_info {
            self.persona_info.write().await.insert(call_id.clone(), info);
        }

        let params = InitiateCallParams {
            call_id: call_id.clone(),
            from,
            to,
            webhook_url: self.config.webhook_url.clone(),
        };

        match self.provider.initiate_call(params).await {
            Ok(provider_call_id) => {
                let mut active = self.active.write().await;
                if let Some(record) = active.get_mut(&call_id) {
                    record.provider_call_id = Some(provider_call_id.clone());
                    self.journal.append(record).map_err(|e| e.to_string())?;
                }
                drop(active);
                self.provider_index.write().await.insert(provider_call_id, call_id.clone());
                info!(call_id = %call_id, "call initiated");
                Ok(InitiateResult { call_id })
            }
            Err(e) => {
                let mut active = self.active.write().await;
                if let Some(record) = active.get_mut(&call_id) {
                    record.apply_transition(CallState::Failed, now_ms(), Some("failed"));
                    self.journal.append(record).map_err(|e| e.to_string())?;
                }
                active.remove(&call_id);
                Err(format!("REST create failed: {e}"))
            }
        }
    }

    /// Narrow capability handle for C5: issue the provider REST hangup for
    /// a model-requested hangup, without finalizing the record. The
    /// carrier's subsequent `completed`/`busy`/`failed` status webhook (or,
    /// failing that, the max-duration timer) is what actually drives the
    /// terminal transition — this keeps `endReason` reflecting how the
    /// carrier says the call really ended (§8 S1), rather than stamping
    /// every model-initiated hangup as `hangup-bot`.
    pub async fn request_provider_hangup(&self, call_id: &str) -> Result<(), String> {
        let provider_call_id = {
            let active = self.active.read().await;
            match active.get(call_id) {
                Some(record) if record.state.is_terminal() => return Ok(()),
                Some(record) => record.provider_call_id.clone(),
                None => return self.no_op_if_already_terminal(call_id),
            }
        };
        if let Some(provider_call_id) = provider_call_id {
            self.provider.hangup_call(&provider_call_id).await?;
        }
        Ok(())
    }

    /// User-facing `end_call` operation (§4.6): hang up immediately and
    /// finalize the record without waiting on a carrier webhook.
    pub async fn end_call(self: &Arc<Self>, call_id: &str) -> Result<(), String> {
        let provider_call_id = {
            let active = self.active.read().await;
            match active.get(call_id) {
                Some(record) if record.state.is_terminal() => return Ok(()),
                Some(record) => record.provider_call_id.clone(),
                None => return self.no_op_if_already_terminal(call_id),
            }
        };

        if let Some(provider_call_id) = provider_call_id {
            self.provider.hangup_call(&provider_call_id).await?;
        }

        self.finalize(call_id, CallState::HangupBot, "hangup-bot").await;
        Ok(())
    }

    /// A call absent from the active map has either never existed or has
    /// already reached a terminal state and been evicted (§3 lifecycle).
    /// Consult the journal to tell the two apart: §4.6 says `end_call` is a
    /// no-op on a terminal call, not an error.
    fn no_op_if_already_terminal(&self, call_id: &str) -> Result<(), String> {
        match self.get_call_from_store(call_id) {
            Some(record) if record.state.is_terminal() => Ok(()),
            _ => Err(format!("unknown call {call_id}")),
        }
    }

    async fn finalize(self: &Arc<Self>, call_id: &str, target: CallState, reason: &str) {
        if let Some(handle) = self.duration_timers.write().await.remove(call_id) {
            handle.abort();
        }

        let record = {
            let mut active = self.active.write().await;
            match active.get_mut(call_id) {
                Some(record) => {
                    let transitioned = record.apply_transition(target, now_ms(), Some(reason));
                    if !transitioned {
                        return;
                    }
                    let record = record.clone();
                    active.remove(call_id);
                    record
                }
                None => return,
            }
        };
        if let Some(provider_call_id) = &record.provider_call_id {
            self.provider_index.write().await.remove(provider_call_id);
        }
        let _ = self.journal.append(&record);
        self.fire_completion(record).await;
    }

    /// Idempotent event application: unknown or already-applied events are
    /// dropped; transitions are applied via the admission rule.
    pub async fn process_event(self: &Arc<Self>, event: NormalizedEvent) {
        let call_id = self.resolve_call_id(&event).await;
        let call_id = match call_id {
            Some(id) => id,
            None => {
                warn!(event = ?event, "dropping event for unknown call");
                return;
            }
        };

        if let Some(provider_call_id) = event.provider_call_id() {
            self.rebind_provider_call_id(&call_id, provider_call_id).await;
        }

        {
            let mut active = self.active.write().await;
            let record = match active.get_mut(&call_id) {
                Some(r) => r,
                None => return,
            };
            if !record.processed_event_ids.insert(event.event_id().to_string()) {
                return; // already applied — idempotent drop
            }
        }

        match &event {
            NormalizedEvent::Initiated { .. } => {
                self.apply(&call_id, CallState::Initiated, None).await;
            }
            NormalizedEvent::Ringing { .. } => {
                self.apply(&call_id, CallState::Ringing, None).await;
            }
            NormalizedEvent::Answered { .. } => {
                self.apply(&call_id, CallState::Answered, None).await;
                self.start_duration_timer(call_id.clone()).await;
            }
            NormalizedEvent::Ended { reason, .. } => {
                let target = match reason.as_str() {
                    "busy" => CallState::Busy,
                    "no-answer" => CallState::NoAnswer,
                    "failed" => CallState::Failed,
                    "hangup-bot" => CallState::HangupBot,
                    _ => CallState::Completed,
                };
                self.finalize(&call_id, target, reason).await;
            }
            NormalizedEvent::Speech { text, .. } => {
                self.add_transcript(&call_id, Speaker::User, text.clone(), true).await;
            }
            NormalizedEvent::Dtmf { .. } => {}
        }
    }

    async fn resolve_call_id(&self, event: &NormalizedEvent) -> Option<String> {
        let active = self.active.read().await;
        if active.contains_key(event.call_id()) {
            return Some(event.call_id().to_string());
        }
        drop(active);
        let index = self.provider_index.read().await;
        index.get(event.call_id()).cloned()
    }

    /// Keep `record.provider_call_id` and the reverse index in sync with
    /// whatever provider id the carrier attached to this delivery, even when
    /// `call_id` itself resolved through the `callId` query param rather
    /// than the provider id (§3 invariant 6: "providerCallId may change
    /// once ... the reverse index is updated atomically with the record";
    /// §4.6). The record field and the index are mutated within the same
    /// `active` write lock so a concurrent `resolve_call_id` never observes
    /// one updated without the other.
    async fn rebind_provider_call_id(&self, call_id: &str, provider_call_id: &str) {
        let mut active = self.active.write().await;
        let Some(record) = active.get_mut(call_id) else { return };
        if record.provider_call_id.as_deref() == Some(provider_call_id) {
            return; // already bound to this provider id
        }
        let previous = record.provider_call_id.replace(provider_call_id.to_string());
        let _ = self.journal.append(record);
        drop(active);

        let mut index = self.provider_index.write().await;
        index.insert(provider_call_id.to_string(), call_id.to_string());
        if let Some(previous) = previous {
            if previous != provider_call_id {
                index.remove(&previous);
            }
        }
    }

    async fn apply(self: &Arc<Self>, call_id: &str, target: CallState, reason: Option<&str>) {
        let mut active = self.active.write().await;
        if let Some(record) = active.get_mut(call_id) {
            if record.apply_transition(target, now_ms(), reason) {
                let _ = self.journal.append(record);
            }
        }
    }

    async fn start_duration_timer(self: &Arc<Self>, call_id: String) {
        let manager = self.clone();
        let duration = std::time::Duration::from_secs(self.config.max_duration_seconds);
        let timer_call_id = call_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            manager.finalize(&timer_call_id, CallState::Timeout, "timeout").await;
        });
        self.duration_timers.write().await.insert(call_id, handle);
    }

    /// Narrow capability handles for C5: drive the `active`/`speaking`/
    /// `listening` transitions that only the audio bridge can observe.
    pub async fn mark_active(self: &Arc<Self>, call_id: &str) {
        self.apply(call_id, CallState::Active, None).await;
    }

    pub async fn mark_speaking(self: &Arc<Self>, call_id: &str) {
        self.apply(call_id, CallState::Speaking, None).await;
    }

    pub async fn mark_listening(self: &Arc<Self>, call_id: &str) {
        self.apply(call_id, CallState::Listening, None).await;
    }

    pub async fn add_transcript(&self, call_id: &str, speaker: Speaker, text: String, is_final: bool) {
        let mut active = self.active.write().await;
        if let Some(record) = active.get_mut(call_id) {
            record.add_transcript(speaker, text, is_final, now_ms());
            let _ = self.journal.append(record);
        }
    }

    pub async fn get_call(&self, call_id: &str) -> Option<CallRecord> {
        self.active.read().await.get(call_id).cloned()
    }

    pub async fn get_active_calls(&self) -> Vec<CallRecord> {
        self.active.read().await.values().cloned().collect()
    }

    pub async fn get_call_by_provider_call_id(&self, provider_call_id: &str) -> Option<CallRecord> {
        let call_id = self.provider_index.read().await.get(provider_call_id).cloned()?;
        self.get_call(&call_id).await
    }

    pub fn get_call_from_store(&self, call_id: &str) -> Option<CallRecord> {
        self.journal.read_all().ok()?.remove(call_id)
    }

    /// Narrow capability handle for C5: look up the persona prompt for a
    /// call without exposing the rest of the manager.
    pub async fn get_persona_prompt(&self, call_id: &str) -> Option<String> {
        let active = self.active.read().await;
        let record = active.get(call_id)?;
        match record.metadata.get("personaPrompt")? {
            serde_json::Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub async fn get_persona_info(&self, call_id: &str) -> Option<PersonaCallInfo> {
        self.persona_info.read().await.get(call_id).cloned()
    }

    /// Narrow capability handle for C5: the initial greeting to put in the
    /// model's mouth, if `persona_call` supplied one.
    pub async fn get_initial_greeting(&self, call_id: &str) -> Option<String> {
        let active = self.active.read().await;
        let record = active.get(call_id)?;
        match record.metadata.get("initialMessage")? {
            serde_json::Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Resolve an internal `call_id` from the `providerCallId` the carrier
    /// hands the bridge at `start` — the narrow lookup C5 needs without
    /// exposing the rest of the manager.
    pub async fn call_id_for_provider_call_id(&self, provider_call_id: &str) -> Option<String> {
        self.provider_index.read().await.get(provider_call_id).cloned()
    }

    /// Test-only: prime the preflight success cache so `initiate_call`
    /// doesn't attempt a real HTTP/web-socket probe.
    #[cfg(test)]
    fn prime_preflight_cache(&self, now_ms: i64) {
        self.preflight.last_success_ms.store(now_ms, std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telephony::mock::MockProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_manager() -> Arc<CallManager> {
        // Leaked so the journal's directory outlives the manager for the
        // rest of the test; each test gets its own fresh directory.
        let path = tempfile::tempdir().unwrap().into_path();
        let journal = Journal::open(&path).unwrap();
        let config = ManagerConfig {
            max_concurrent_calls: 1,
            max_duration_seconds: 300,
            webhook_url: "http://127.0.0.1:1/hook".to_string(),
            webhook_host: "127.0.0.1".to_string(),
            stream_ws_url: "ws://127.0.0.1:1/stream".to_string(),
            boot_secret: "secret".to_string(),
        };
        let manager = Arc::new(CallManager::new(Arc::new(MockProvider::new()), journal, config));
        manager.prime_preflight_cache(now_ms());
        manager
    }

    async fn initiate(manager: &Arc<CallManager>, to: &str) -> String {
        manager
            .initiate_call(
                to.to_string(),
                "+15550000000".to_string(),
                "session-key".to_string(),
                None,
                None,
                None,
            )
            .await
            .expect("initiate_call should succeed against the mock provider")
            .call_id
    }

    #[tokio::test]
    async fn happy_path_reaches_completed_and_fires_callback_once() {
        let manager = test_manager();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        manager.set_on_call_complete(move |record| {
            assert_eq!(record.state, CallState::Completed);
            assert_eq!(record.end_reason.as_deref(), Some("completed"));
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        let call_id = initiate(&manager, "+15550001234").await;
        let provider_call_id = manager.get_call(&call_id).await.unwrap().provider_call_id.unwrap();

        manager
            .process_event(NormalizedEvent::Ringing {
                call_id: call_id.clone(),
                event_id: "e1".to_string(),
                provider_call_id: None,
            })
            .await;
        manager
            .process_event(NormalizedEvent::Answered {
                call_id: call_id.clone(),
                event_id: "e2".to_string(),
                provider_call_id: None,
            })
            .await;
        assert_eq!(manager.get_call(&call_id).await.unwrap().state, CallState::Answered);

        manager
            .add_transcript(&call_id, Speaker::Bot, "hello".to_string(), true)
            .await;
        manager
            .add_transcript(&call_id, Speaker::User, "hi there".to_string(), true)
            .await;

        // The carrier's own status webhook drives the terminal transition,
        // referenced by its provider call id rather than the internal one.
        manager
            .process_event(NormalizedEvent::Ended {
                call_id: provider_call_id.clone(),
                event_id: "e3".to_string(),
                reason: "completed".to_string(),
                provider_call_id: Some(provider_call_id),
            })
            .await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Terminal records are evicted from the active map.
        assert!(manager.get_call(&call_id).await.is_none());

        let stored = manager.get_call_from_store(&call_id).unwrap();
        assert_eq!(stored.state, CallState::Completed);
        assert_eq!(stored.transcript.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_event_id_is_dropped() {
        let manager = test_manager();
        let call_id = initiate(&manager, "+15550001234").await;

        manager
            .process_event(NormalizedEvent::Ringing {
                call_id: call_id.clone(),
                event_id: "dup".to_string(),
                provider_call_id: None,
            })
            .await;
        assert_eq!(manager.get_call(&call_id).await.unwrap().state, CallState::Ringing);

        // Same event id redelivered: must not regress or otherwise mutate state.
        manager
            .process_event(NormalizedEvent::Ringing {
                call_id: call_id.clone(),
                event_id: "dup".to_string(),
                provider_call_id: None,
            })
            .await;
        assert_eq!(manager.get_call(&call_id).await.unwrap().state, CallState::Ringing);
    }

    #[tokio::test]
    async fn concurrency_cap_rejects_second_call() {
        let manager = test_manager(); // max_concurrent_calls: 1
        initiate(&manager, "+15550001111").await;

        let result = manager
            .initiate_call(
                "+15550002222".to_string(),
                "+15550000000".to_string(),
                "session-key-2".to_string(),
                None,
                None,
                None,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(manager.get_active_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn end_call_finalizes_as_hangup_bot_and_fires_callback_once() {
        let manager = test_manager();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        manager.set_on_call_complete(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        let call_id = initiate(&manager, "+15550001234").await;
        manager.end_call(&call_id).await.unwrap();

        assert!(manager.get_call(&call_id).await.is_none());
        let stored = manager.get_call_from_store(&call_id).unwrap();
        assert_eq!(stored.state, CallState::HangupBot);
        assert_eq!(stored.end_reason.as_deref(), Some("hangup-bot"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // end_call on an already-terminal call is a no-op, not a second callback.
        manager.end_call(&call_id).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn request_provider_hangup_does_not_finalize_the_record() {
        let manager = test_manager();
        let call_id = initiate(&manager, "+15550001234").await;

        manager.request_provider_hangup(&call_id).await.unwrap();

        // Unlike end_call, this leaves the record active for the carrier's
        // own status webhook (or the duration timer) to finalize.
        let record = manager.get_call(&call_id).await.unwrap();
        assert!(!record.state.is_terminal());
    }

    #[tokio::test]
    async fn rebinds_reverse_index_when_provider_call_id_changes() {
        let manager = test_manager();
        let call_id = initiate(&manager, "+15550001234").await;
        let original_provider_call_id =
            manager.get_call(&call_id).await.unwrap().provider_call_id.unwrap();

        // A later delivery carries a corrected provider id in its own
        // payload while still being routed by our internal call_id (e.g.
        // the `callId` query param wins for routing but the body's CallSid
        // differs from what initiate_call originally recorded).
        manager
            .process_event(NormalizedEvent::Ringing {
                call_id: call_id.clone(),
                event_id: "e1".to_string(),
                provider_call_id: Some("CA-CORRECTED-SID".to_string()),
            })
            .await;

        let record = manager.get_call(&call_id).await.unwrap();
        assert_eq!(record.provider_call_id.as_deref(), Some("CA-CORRECTED-SID"));
        assert!(manager.call_id_for_provider_call_id(&original_provider_call_id).await.is_none());
        assert_eq!(
            manager.call_id_for_provider_call_id("CA-CORRECTED-SID").await,
            Some(call_id.clone())
        );

        // A duplicate delivery of the same provider id is a no-op, not a
        // second journal write or index thrash.
        manager
            .process_event(NormalizedEvent::Ringing {
                call_id: call_id.clone(),
                event_id: "e2".to_string(),
                provider_call_id: Some("CA-CORRECTED-SID".to_string()),
            })
            .await;
        assert_eq!(
            manager.get_call(&call_id).await.unwrap().provider_call_id.as_deref(),
            Some("CA-CORRECTED-SID")
        );
    }

    #[tokio::test]
    async fn speaking_and_listening_alternate_without_regressing_progression() {
        let manager = test_manager();
        let call_id = initiate(&manager, "+15550001234").await;
        manager
            .process_event(NormalizedEvent::Answered {
                call_id: call_id.clone(),
                event_id: "e1".to_string(),
                provider_call_id: None,
            })
            .await;
        manager.mark_active(&call_id).await;
        manager.mark_speaking(&call_id).await;
        manager.mark_listening(&call_id).await;
        manager.mark_speaking(&call_id).await;
        assert_eq!(manager.get_call(&call_id).await.unwrap().state, CallState::Speaking);
    }
}
