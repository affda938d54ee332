//! Assistant turn bookkeeping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a turn was considered finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnCompletion {
    /// All three completion signals were observed
    Signals,
    /// Forced by the bounded fallback timer; a diagnostic, not an error
    FallbackTimeout,
    /// Forced because a newer response began before this one finished
    Superseded,
    /// Forced by session teardown
    SessionClosed,
}

impl TurnCompletion {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnCompletion::Signals => "signals",
            TurnCompletion::FallbackTimeout => "fallback_timeout",
            TurnCompletion::Superseded => "superseded",
            TurnCompletion::SessionClosed => "session_closed",
        }
    }
}

impl std::fmt::Display for TurnCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One assistant utterance/response cycle.
///
/// Created when the upstream signals the start of a response; replaced when
/// the next turn begins or the session ends. A turn is complete iff all
/// three condition booleans are true, or completion was forced. Either
/// way completion happens exactly once, recorded in `completion`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Upstream response identifier this turn tracks
    pub response_id: String,
    /// Accumulated transcript text
    pub transcript: String,
    /// Synthesized audio began playing
    pub audio_started: bool,
    /// Synthesized audio finished playing
    pub audio_ended: bool,
    /// Upstream marked the transcript final
    pub transcript_finalized: bool,
    /// Upstream response-complete control message received
    pub upstream_completed: bool,
    /// Set exactly once when the turn finishes
    pub completion: Option<TurnCompletion>,
    pub started_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(response_id: impl Into<String>) -> Self {
        Self {
            response_id: response_id.into(),
            transcript: String::new(),
            audio_started: false,
            audio_ended: false,
            transcript_finalized: false,
            upstream_completed: false,
            completion: None,
            started_at: Utc::now(),
        }
    }

    /// Append a transcript fragment
    pub fn push_delta(&mut self, delta: &str) {
        self.transcript.push_str(delta);
    }

    /// The three-way completion conjunction, independent of signal order
    pub fn signals_met(&self) -> bool {
        self.audio_ended && self.transcript_finalized && self.upstream_completed
    }

    pub fn is_complete(&self) -> bool {
        self.completion.is_some()
    }
}
