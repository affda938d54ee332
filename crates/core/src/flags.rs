//! Session control flags
//!
//! Restart/auto-reconnect bookkeeping kept separate from the connection
//! phase. The flags are a single value type owned by the session state
//! machine and reset as one unit, never mutated piecemeal from multiple
//! call sites.

use serde::{Deserialize, Serialize};

/// Lifecycle bookkeeping distinct from [`ConnectionPhase`].
///
/// Defaults are `(false, true, false)` and MUST be restored on every
/// manager initialization and every destroy via [`reset`].
///
/// [`ConnectionPhase`]: crate::ConnectionPhase
/// [`reset`]: SessionControlFlags::reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionControlFlags {
    /// The user explicitly ended the current session
    pub user_ended_session: bool,
    /// Automatic reconnection is permitted
    pub allow_auto_restart: bool,
    /// Lifecycle management is suspended entirely (external override)
    pub session_management_disabled: bool,
}

impl Default for SessionControlFlags {
    fn default() -> Self {
        Self {
            user_ended_session: false,
            allow_auto_restart: true,
            session_management_disabled: false,
        }
    }
}

impl SessionControlFlags {
    /// Restore defaults. The only sanctioned way to clear these flags.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record a user-initiated stop: blocks auto-restart until the next
    /// explicit start resets the flags.
    pub fn mark_user_ended(&mut self) {
        self.user_ended_session = true;
        self.allow_auto_restart = false;
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let flags = SessionControlFlags::default();
        assert!(!flags.user_ended_session);
        assert!(flags.allow_auto_restart);
        assert!(!flags.session_management_disabled);
        assert!(flags.is_default());
    }

    #[test]
    fn test_user_ended_blocks_restart() {
        let mut flags = SessionControlFlags::default();
        flags.mark_user_ended();
        assert!(flags.user_ended_session);
        assert!(!flags.allow_auto_restart);
        assert!(!flags.is_default());
    }

    #[test]
    fn test_reset_restores_defaults_as_one_unit() {
        let mut flags = SessionControlFlags {
            user_ended_session: true,
            allow_auto_restart: false,
            session_management_disabled: true,
        };
        flags.reset();
        assert!(flags.is_default());
    }
}
