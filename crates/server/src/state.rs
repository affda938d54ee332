//! Application state
//!
//! Shared state across all handlers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use colloquy_config::Settings;
use colloquy_session::SessionManager;

use crate::breaker::StartCircuitBreaker;

/// Application state
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration; the manager keeps its own copy of the
    /// tuning it was built with
    pub config: Arc<Settings>,
    /// The single session controller
    pub manager: SessionManager,
    /// Shields the start path from repeated upstream failures
    pub breaker: Arc<StartCircuitBreaker>,
    /// Process start time, reported by the health endpoint
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Settings, manager: SessionManager) -> Self {
        let breaker = Arc::new(StartCircuitBreaker::from_settings(&config.server));
        Self {
            config: Arc::new(config),
            manager,
            breaker,
            started_at: Utc::now(),
        }
    }
}
