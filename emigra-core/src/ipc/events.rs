//! Events a voice session reports to its host.
//!
//! | Event | Meaning |
//! |-------|---------|
//! | `VoiceEvent::State` | status changed (`connecting`, `listening`, `speaking`, `error`, `closed`) |
//! | `VoiceEvent::Volume` | input level for one captured block |
//! | `VoiceEvent::Complete` | the interviewer finished the evaluation |
//! | `VoiceEvent::Close` | the session is over; always the last event |
//!
//! All types serialise to camelCase JSON for the presentation shell.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCategory;

/// Observable status of a voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Listening,
    Speaking,
    Error,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Error | SessionState::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Listening => "listening",
            SessionState::Speaking => "speaking",
            SessionState::Error => "error",
            SessionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing description of why a session entered `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionErrorInfo {
    pub category: ErrorCategory,
    pub message: String,
    /// Extra advice on constrained devices.
    pub hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStateEvent {
    pub state: SessionState,
    /// Present only when `state` is `error`.
    pub error: Option<SessionErrorInfo>,
}

/// Level of one captured block, in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeEvent {
    /// Monotonically increasing per session.
    pub seq: u64,
    pub level: f32,
}

/// Final result handed back when the interviewer completes the evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    /// Always `"success"`.
    pub status: String,
    /// Case viability, 0 to 100.
    pub viability: f64,
    pub summary: String,
}

impl EvaluationResult {
    pub fn success(viability: f64, summary: impl Into<String>) -> Self {
        let viability = if viability.is_finite() {
            viability.clamp(0.0, 100.0)
        } else {
            0.0
        };
        Self {
            status: "success".to_string(),
            viability,
            summary: summary.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum VoiceEvent {
    State(SessionStateEvent),
    Volume(VolumeEvent),
    Complete(EvaluationResult),
    Close,
}
