//! Start-failure circuit breaker
//!
//! A run of consecutive start failures almost always means the token
//! service or the upstream API is down, and every retry costs a token
//! mint. After `threshold` failures in a row the breaker opens and start
//! requests are answered with 429 until the cooldown passes; the first
//! attempt after the cooldown re-closes it on success or re-opens it on
//! failure.

use std::time::Duration;

use colloquy_config::ServerConfig;
use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Shields the session start path from hammering a failing upstream.
#[derive(Debug)]
pub struct StartCircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl StartCircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn from_settings(settings: &ServerConfig) -> Self {
        Self::new(
            settings.start_failure_threshold,
            Duration::from_secs(settings.start_cooldown_secs),
        )
    }

    /// Whether a start attempt may proceed. While open, returns how long
    /// the caller should wait before retrying.
    pub fn check(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        match state.open_until {
            Some(until) => {
                let now = Instant::now();
                if now < until {
                    Err(until - now)
                } else {
                    // Cooldown over: let one attempt through. The failure
                    // count stays at the threshold so another failure
                    // re-opens immediately.
                    state.open_until = None;
                    Ok(())
                }
            }
            None => Ok(()),
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= self.threshold && state.open_until.is_none() {
            state.open_until = Some(Instant::now() + self.cooldown);
            tracing::warn!(
                failures = state.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Start circuit breaker opened"
            );
            metrics::counter!("colloquy_start_breaker_trips_total").increment(1);
        }
    }

    /// True while starts are suppressed.
    pub fn is_open(&self) -> bool {
        let state = self.state.lock();
        matches!(state.open_until, Some(until) if Instant::now() < until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_failures() {
        let breaker = StartCircuitBreaker::new(3, Duration::from_secs(30));

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.check().is_ok());

        breaker.record_failure();
        assert!(breaker.is_open());
        let retry_after = breaker.check().unwrap_err();
        assert!(retry_after <= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_the_run() {
        let breaker = StartCircuitBreaker::new(2, Duration::from_secs(30));

        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(breaker.check().is_ok(), "run was reset by the success");
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cooldown() {
        let breaker = StartCircuitBreaker::new(1, Duration::from_secs(30));

        breaker.record_failure();
        assert!(breaker.check().is_err());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(breaker.check().is_ok(), "cooldown expired");

        // The probe attempt failing re-opens immediately.
        breaker.record_failure();
        assert!(breaker.check().is_err());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(breaker.check().is_ok());
        breaker.record_success();
        assert!(!breaker.is_open());
    }
}
