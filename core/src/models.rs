//! Data models for QR Parking calls

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub token: String,
    pub user_id: String,
    pub display_name: String,
    /// Unix seconds.
    pub expires_at: i64,
}

// ============================================================================
// Calling token
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenRecord {
    /// Usable only while `now` is before `expires_at - buffer`.
    pub fn is_fresh(&self, now: DateTime<Utc>, buffer: chrono::Duration) -> bool {
        now < self.expires_at - buffer
    }
}

// ============================================================================
// Call records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    Initiated,
    Answered,
    Ended,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initiated => "INITIATED",
            CallStatus::Answered => "ANSWERED",
            CallStatus::Ended => "ENDED",
            CallStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIATED" => Ok(CallStatus::Initiated),
            "ANSWERED" => Ok(CallStatus::Answered),
            "ENDED" => Ok(CallStatus::Ended),
            "FAILED" => Ok(CallStatus::Failed),
            other => Err(Error::Validation(format!("unknown call status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: String,
    pub receiver_id: String,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub answered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
}

impl CallRecord {
    /// Move to `status`, stamping the matching timestamp field.
    pub fn mark(&mut self, status: CallStatus, at: DateTime<Utc>) {
        self.status = status;
        match status {
            CallStatus::Answered => self.answered_at = Some(at),
            CallStatus::Ended => self.ended_at = Some(at),
            CallStatus::Failed => self.failed_at = Some(at),
            CallStatus::Initiated => {}
        }
    }
}

/// A status write that could not be delivered, waiting for connectivity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingStatusUpdate {
    pub entry_id: i64,
    pub call_id: String,
    pub status: CallStatus,
    /// When the transition happened, sent as the status timestamp.
    pub occurred_at: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
}

// ============================================================================
// Call state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    CallEnd,
    HangUp,
    OnlySelfInRoom,
    Cleanup,
    /// A failure signal that arrived after the call was answered.
    Dropped(FailureReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Busy,
    Declined,
    Timeout,
    InvitationFailed,
}

impl FailureReason {
    pub fn alert_message(&self) -> &'static str {
        match self {
            FailureReason::Busy => "The vehicle owner is on another call.",
            FailureReason::Declined => "The vehicle owner declined the call.",
            FailureReason::Timeout => "The vehicle owner did not answer.",
            FailureReason::InvitationFailed => "The call could not be connected.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    Answered,
    Ended(EndReason),
    Failed(FailureReason),
}

/// The call currently owned by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveCall {
    pub call_id: String,
    pub receiver_id: Option<String>,
    pub is_caller: bool,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Initiated(ActiveCall),
    Answered(ActiveCall),
    Ended(ActiveCall, EndReason),
    Failed(ActiveCall, FailureReason),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition from {from} on {event:?}")]
pub struct TransitionError {
    pub from: &'static str,
    pub event: CallEvent,
}

impl CallState {
    pub fn call(&self) -> Option<&ActiveCall> {
        match self {
            CallState::Idle => None,
            CallState::Initiated(call)
            | CallState::Answered(call)
            | CallState::Ended(call, _)
            | CallState::Failed(call, _) => Some(call),
        }
    }

    pub fn status(&self) -> Option<CallStatus> {
        match self {
            CallState::Idle => None,
            CallState::Initiated(_) => Some(CallStatus::Initiated),
            CallState::Answered(_) => Some(CallStatus::Answered),
            CallState::Ended(..) => Some(CallStatus::Ended),
            CallState::Failed(..) => Some(CallStatus::Failed),
        }
    }

    fn name(&self) -> &'static str {
        self.status().map(|s| s.as_str()).unwrap_or("IDLE")
    }

    pub fn is_active(&self) -> bool {
        matches!(self, CallState::Initiated(_) | CallState::Answered(_))
    }

    /// Single transition function. Terminal states and `Idle` accept nothing.
    /// A failure after answer still ends the call, since ANSWERED -> FAILED
    /// is not a legal status move.
    pub fn apply(&self, event: CallEvent, at: DateTime<Utc>) -> Result<CallState, TransitionError> {
        match (self, event) {
            (CallState::Initiated(call), CallEvent::Answered) => {
                let mut call = call.clone();
                call.answered_at = Some(at);
                Ok(CallState::Answered(call))
            }
            (CallState::Initiated(call) | CallState::Answered(call), CallEvent::Ended(reason)) => {
                Ok(CallState::Ended(call.clone(), reason))
            }
            (CallState::Initiated(call), CallEvent::Failed(reason)) => {
                Ok(CallState::Failed(call.clone(), reason))
            }
            (CallState::Answered(call), CallEvent::Failed(reason)) => {
                Ok(CallState::Ended(call.clone(), EndReason::Dropped(reason)))
            }
            _ => Err(TransitionError {
                from: self.name(),
                event,
            }),
        }
    }
}

// ============================================================================
// UI notices
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Ended(EndReason),
    Failed(FailureReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    /// User-facing alert for an SDK-level failure.
    Alert { message: String },
    /// The call screen should be left.
    CallClosed { call_id: String, outcome: CallOutcome },
}
