//! Typed session event vocabulary
//!
//! Events are produced by the session state machine and fanned out to
//! subscribers. `SessionEventKind` is the discriminant used for
//! subscription routing; the serialized names match the names the UI layer
//! subscribes to.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ConnectionPhase, ScenarioId, TurnCompletion};

/// Error categories carried by [`SessionEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport negotiation or an established connection failed
    ConnectionFailed,
    /// ICE specifically failed or timed out
    IceFailed,
    /// Credential issuance failed; the session never reached connecting
    TokenFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionFailed => "connection_failed",
            ErrorKind::IceFailed => "ice_failed",
            ErrorKind::TokenFailed => "token_failed",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Discriminant for subscription routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionEventKind {
    Connecting,
    Connected,
    SpeechStarted,
    SpeechEnded,
    TranscriptDelta,
    TranscriptComplete,
    SessionStopped,
    Error,
    StateChanged,
}

impl SessionEventKind {
    /// All event kinds, in the order they occur in a normal run.
    pub const ALL: [SessionEventKind; 9] = [
        SessionEventKind::Connecting,
        SessionEventKind::Connected,
        SessionEventKind::SpeechStarted,
        SessionEventKind::TranscriptDelta,
        SessionEventKind::TranscriptComplete,
        SessionEventKind::SpeechEnded,
        SessionEventKind::SessionStopped,
        SessionEventKind::Error,
        SessionEventKind::StateChanged,
    ];

    /// The name subscribers use for this kind, identical to the
    /// serialized `event` tag.
    pub fn as_wire_name(&self) -> &'static str {
        match self {
            SessionEventKind::Connecting => "connecting",
            SessionEventKind::Connected => "connected",
            SessionEventKind::SpeechStarted => "speechStarted",
            SessionEventKind::SpeechEnded => "speechEnded",
            SessionEventKind::TranscriptDelta => "transcriptDelta",
            SessionEventKind::TranscriptComplete => "transcriptComplete",
            SessionEventKind::SessionStopped => "sessionStopped",
            SessionEventKind::Error => "error",
            SessionEventKind::StateChanged => "stateChanged",
        }
    }
}

impl std::fmt::Display for SessionEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_wire_name())
    }
}

/// A session domain event.
///
/// In a normal run, events arrive in strict order: `Connecting` →
/// `Connected` → per turn `SpeechStarted` → `TranscriptDelta`* →
/// `TranscriptComplete` → `SpeechEnded` → finally `SessionStopped`, which
/// is guaranteed to be the last event of a session. `StateChanged` fires on
/// every phase edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SessionEvent {
    Connecting {
        scenario: ScenarioId,
    },
    Connected {
        scenario: ScenarioId,
    },
    SpeechStarted {
        response_id: String,
    },
    /// The turn finished; `completion` records which path finished it.
    SpeechEnded {
        response_id: String,
        transcript: String,
        completion: TurnCompletion,
    },
    TranscriptDelta {
        response_id: String,
        delta: String,
    },
    TranscriptComplete {
        response_id: String,
        transcript: String,
    },
    SessionStopped {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
        by_user: bool,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    StateChanged {
        from: ConnectionPhase,
        to: ConnectionPhase,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> SessionEventKind {
        match self {
            SessionEvent::Connecting { .. } => SessionEventKind::Connecting,
            SessionEvent::Connected { .. } => SessionEventKind::Connected,
            SessionEvent::SpeechStarted { .. } => SessionEventKind::SpeechStarted,
            SessionEvent::SpeechEnded { .. } => SessionEventKind::SpeechEnded,
            SessionEvent::TranscriptDelta { .. } => SessionEventKind::TranscriptDelta,
            SessionEvent::TranscriptComplete { .. } => SessionEventKind::TranscriptComplete,
            SessionEvent::SessionStopped { .. } => SessionEventKind::SessionStopped,
            SessionEvent::Error { .. } => SessionEventKind::Error,
            SessionEvent::StateChanged { .. } => SessionEventKind::StateChanged,
        }
    }
}
