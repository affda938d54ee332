//! Session identity and snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ConnectionPhase, SessionControlFlags, Turn};

/// Opaque practice-scenario identifier (e.g. `"greetings"`, `"ordering-food"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScenarioId(String);

impl ScenarioId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ScenarioId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ScenarioId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Learner proficiency, passed through to the token provider for prompt
/// personalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProficiencyLevel {
    #[default]
    Beginner,
    Elementary,
    Intermediate,
    Advanced,
}

impl ProficiencyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProficiencyLevel::Beginner => "beginner",
            ProficiencyLevel::Elementary => "elementary",
            ProficiencyLevel::Intermediate => "intermediate",
            ProficiencyLevel::Advanced => "advanced",
        }
    }
}

impl std::fmt::Display for ProficiencyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Caller identity, opaque to the core. Forwarded to the token provider so
/// the issued instructions can address the learner by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl UserContext {
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            user_id: None,
            display_name: Some(display_name.into()),
        }
    }
}

/// One logical conversation run.
///
/// At most one descriptor is live (non-terminal phase) per manager instance
/// at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: Uuid,
    pub scenario: ScenarioId,
    pub level: ProficiencyLevel,
    #[serde(default)]
    pub user: UserContext,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionDescriptor {
    pub fn new(scenario: ScenarioId, level: ProficiencyLevel, user: UserContext) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            scenario,
            level,
            user,
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

/// Synchronous read of the manager's state, safe to take from any thread.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub phase: ConnectionPhase,
    pub flags: SessionControlFlags,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario: Option<ScenarioId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<Turn>,
}

impl SessionSnapshot {
    /// Snapshot of a manager with no session
    pub fn idle() -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            flags: SessionControlFlags::default(),
            session_id: None,
            scenario: None,
            turn: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_gets_fresh_id() {
        let a = SessionDescriptor::new("greetings".into(), ProficiencyLevel::Beginner, UserContext::default());
        let b = SessionDescriptor::new("greetings".into(), ProficiencyLevel::Beginner, UserContext::default());
        assert_ne!(a.session_id, b.session_id);
        assert!(a.ended_at.is_none());
    }

    #[test]
    fn test_scenario_id_equality() {
        assert_eq!(ScenarioId::from("food"), ScenarioId::new("food"));
        assert_ne!(ScenarioId::from("food"), ScenarioId::from("directions"));
    }

    #[test]
    fn test_idle_snapshot() {
        let snap = SessionSnapshot::idle();
        assert_eq!(snap.phase, ConnectionPhase::Idle);
        assert!(snap.flags.is_default());
        assert!(snap.scenario.is_none());
    }

    #[test]
    fn test_user_context_wire_names() {
        let user = UserContext {
            user_id: Some("u-42".to_string()),
            display_name: Some("Maya".to_string()),
        };
        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["userId"], "u-42");
        assert_eq!(json["displayName"], "Maya");
    }
}
