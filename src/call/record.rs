//! `CallRecord`: the central call-state entity and its admission rule.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    Initiated,
    Ringing,
    Answered,
    Active,
    Speaking,
    Listening,
    Completed,
    Busy,
    NoAnswer,
    Failed,
    HangupBot,
    Timeout,
    Error,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallState::Completed
                | CallState::Busy
                | CallState::NoAnswer
                | CallState::Failed
                | CallState::HangupBot
                | CallState::Timeout
                | CallState::Error
        )
    }

    /// Ordinal along the non-terminal progression; terminal states have no
    /// ordinal since they're reached from any non-terminal state directly.
    fn ordinal(self) -> Option<u8> {
        match self {
            CallState::Initiated => Some(0),
            CallState::Ringing => Some(1),
            CallState::Answered => Some(2),
            CallState::Active => Some(3),
            CallState::Speaking | CallState::Listening => Some(4),
            _ => None,
        }
    }

    /// Admission rule (§4.6): a move is admitted iff the current state is
    /// non-terminal, and either the target is terminal, or both states are
    /// in `{speaking, listening}`, or the target's ordinal is strictly
    /// greater than the current's.
    pub fn can_transition_to(self, target: CallState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if target.is_terminal() {
            return true;
        }
        let speaking_listening = |s: CallState| matches!(s, CallState::Speaking | CallState::Listening);
        if speaking_listening(self) && speaking_listening(target) {
            return true;
        }
        match (self.ordinal(), target.ordinal()) {
            (Some(from), Some(to)) => to > from,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Bot,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub timestamp: i64,
    pub speaker: Speaker,
    pub text: String,
    pub is_final: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub provider_call_id: Option<String>,
    pub direction: Direction,
    pub state: CallState,
    pub from: String,
    pub to: String,
    pub session_key: String,
    pub started_at: i64,
    pub answered_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub end_reason: Option<String>,
    pub transcript: Vec<TranscriptEntry>,
    pub processed_event_ids: HashSet<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl CallRecord {
    pub fn new(call_id: String, from: String, to: String, session_key: String, now_ms: i64) -> Self {
        Self {
            call_id,
            provider_call_id: None,
            direction: Direction::Outbound,
            state: CallState::Initiated,
            from,
            to,
            session_key,
            started_at: now_ms,
            answered_at: None,
            ended_at: None,
            end_reason: None,
            transcript: Vec::new(),
            processed_event_ids: HashSet::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Apply a state transition per the admission rule. Returns `true` if
    /// the transition was applied, `false` if it was silently dropped.
    pub fn apply_transition(&mut self, target: CallState, now_ms: i64, reason: Option<&str>) -> bool {
        if !self.state.can_transition_to(target) {
            return false;
        }
        self.state = target;
        if target == CallState::Answered && self.answered_at.is_none() {
            self.answered_at = Some(now_ms);
        }
        if target.is_terminal() {
            self.ended_at = Some(now_ms);
            self.end_reason = Some(reason.unwrap_or("unknown").to_string());
        }
        true
    }

    pub fn add_transcript(&mut self, speaker: Speaker, text: String, is_final: bool, now_ms: i64) {
        self.transcript.push(TranscriptEntry {
            timestamp: now_ms,
            speaker,
            text,
            is_final,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotone_progression_is_admitted() {
        assert!(CallState::Initiated.can_transition_to(CallState::Ringing));
        assert!(CallState::Ringing.can_transition_to(CallState::Answered));
        assert!(CallState::Answered.can_transition_to(CallState::Active));
        assert!(CallState::Active.can_transition_to(CallState::Speaking));
    }

    #[test]
    fn backward_progression_is_dropped() {
        assert!(!CallState::Answered.can_transition_to(CallState::Initiated));
        assert!(!CallState::Active.can_transition_to(CallState::Ringing));
    }

    #[test]
    fn speaking_listening_alternate_freely() {
        assert!(CallState::Speaking.can_transition_to(CallState::Listening));
        assert!(CallState::Listening.can_transition_to(CallState::Speaking));
    }

    #[test]
    fn terminal_is_reachable_from_any_non_terminal_state() {
        assert!(CallState::Initiated.can_transition_to(CallState::Failed));
        assert!(CallState::Speaking.can_transition_to(CallState::Completed));
    }

    #[test]
    fn terminal_states_never_transition_again() {
        assert!(!CallState::Completed.can_transition_to(CallState::Active));
        assert!(!CallState::Failed.can_transition_to(CallState::Error));
    }

    #[test]
    fn apply_transition_sets_ended_fields_exactly_once() {
        let mut record = CallRecord::new(
            "c1".to_string(),
            "+15550000000".to_string(),
            "+15550001234".to_string(),
            "key".to_string(),
            1_000,
        );
        assert!(record.apply_transition(CallState::Ringing, 1_100, None));
        assert!(record.apply_transition(CallState::Answered, 1_200, None));
        assert!(record.apply_transition(CallState::Completed, 5_000, Some("completed")));
        assert_eq!(record.ended_at, Some(5_000));
        assert_eq!(record.end_reason.as_deref(), Some("completed"));

        // A second terminal transition is dropped, fields unchanged.
        assert!(!record.apply_transition(CallState::Failed, 6_000, Some("failed")));
        assert_eq!(record.ended_at, Some(5_000));
        assert_eq!(record.end_reason.as_deref(), Some("completed"));
    }
}
