//! Connection lifecycle phases

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Coarse lifecycle state of a conversation session.
///
/// Owned exclusively by the session state machine; no other component
/// mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum ConnectionPhase {
    /// No session; the manager is ready for `start_session`
    #[default]
    Idle,
    /// Credential issued, transport negotiation in progress
    Connecting,
    /// Transport established, waiting for the upstream session to be ready
    Connected,
    /// Upstream session ready; audio and events are flowing
    Active,
    /// Teardown in progress
    Closing,
    /// Unrecoverable transport error; cleanup returns to `Idle`
    Failed,
}

/// Static transition map. `Failed` is reachable from every live phase;
/// `Closing` is reachable before the session is fully active so an early
/// stop does not have to wait for establishment.
static PHASE_TRANSITIONS: Lazy<HashMap<ConnectionPhase, &'static [ConnectionPhase]>> =
    Lazy::new(|| {
        use ConnectionPhase::*;
        let mut map = HashMap::new();
        map.insert(Idle, &[Connecting] as &[_]);
        map.insert(Connecting, &[Connected, Closing, Failed] as &[_]);
        map.insert(Connected, &[Active, Closing, Failed] as &[_]);
        map.insert(Active, &[Closing, Failed] as &[_]);
        map.insert(Closing, &[Idle] as &[_]);
        map.insert(Failed, &[Idle] as &[_]);
        map
    });

impl ConnectionPhase {
    /// Get allowed transitions from the current phase
    pub fn allowed_transitions(&self) -> &'static [ConnectionPhase] {
        PHASE_TRANSITIONS.get(self).copied().unwrap_or(&[])
    }

    /// Check if a transition to the target phase is allowed
    pub fn can_transition_to(&self, target: ConnectionPhase) -> bool {
        self.allowed_transitions().contains(&target)
    }

    /// A session exists in some form (anything but `Idle`)
    pub fn is_live(&self) -> bool {
        !matches!(self, ConnectionPhase::Idle)
    }

    /// Transport-level establishment has completed
    pub fn is_established(&self) -> bool {
        matches!(self, ConnectionPhase::Connected | ConnectionPhase::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionPhase::Idle => "idle",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Connected => "connected",
            ConnectionPhase::Active => "active",
            ConnectionPhase::Closing => "closing",
            ConnectionPhase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
