//! Centralized constants for the session manager
//!
//! Single source of truth for timing windows, endpoints, and audio
//! parameters referenced across the codebase. Settings defaults pull
//! from here so file/env overrides and code agree on the baseline.

/// Session lifecycle timing
pub mod session {
    /// Debounce window for coalescing rapid start requests (ms)
    pub const START_DEBOUNCE_MS: u64 = 500;

    /// Fallback window after the last completion signal before a turn
    /// is force-completed (ms)
    pub const COMPLETION_FALLBACK_MS: u64 = 9_000;

    /// Lower bound for the configurable fallback window (ms)
    pub const COMPLETION_FALLBACK_MIN_MS: u64 = 8_000;

    /// Upper bound for the configurable fallback window (ms)
    pub const COMPLETION_FALLBACK_MAX_MS: u64 = 10_000;

    /// Capacity of the broadcast channel that fans session events out
    /// to websocket subscribers
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;
}

/// WebRTC negotiation defaults
pub mod webrtc {
    /// End-to-end connect timeout covering offer, ICE, and data
    /// channel open (seconds)
    pub const CONNECT_TIMEOUT_SECS: u64 = 30;

    /// Data channel label the upstream speech API expects
    pub const DATA_CHANNEL_LABEL: &str = "oai-events";

    /// Default STUN server used when no ICE servers are configured
    pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

    /// ICE disconnected timeout (seconds) - time before considering peer disconnected
    pub const ICE_DISCONNECTED_TIMEOUT_SECS: u64 = 5;

    /// ICE failed timeout (seconds) - time before declaring connection failed
    pub const ICE_FAILED_TIMEOUT_SECS: u64 = 25;

    /// ICE keep-alive interval (seconds)
    pub const ICE_KEEPALIVE_INTERVAL_SECS: u64 = 2;

    /// How long to wait for candidate gathering before posting the offer
    /// with whatever has been collected (seconds)
    pub const ICE_GATHER_TIMEOUT_SECS: u64 = 10;
}

/// Microphone and Opus encoding parameters
pub mod audio {
    /// Capture sample rate (Hz); Opus operates natively at 48kHz
    pub const MIC_SAMPLE_RATE_HZ: u32 = 48_000;

    /// Frame duration per encoded packet (ms)
    pub const MIC_FRAME_MS: u32 = 20;

    /// Mono capture; the upstream API takes a single voice channel
    pub const CHANNELS: u8 = 1;

    /// Opus target bitrate (bits/s)
    pub const OPUS_BITRATE: i32 = 32_000;
}

/// Service endpoints (defaults for local development)
pub mod endpoints {
    /// Upstream realtime speech API
    pub const REALTIME_DEFAULT: &str = "https://api.openai.com/v1/realtime";

    /// Local token minting service
    pub const TOKEN_SERVICE_DEFAULT: &str = "http://127.0.0.1:8787/realtime-token";
}

/// Request timeouts (in milliseconds unless noted)
pub mod timeouts {
    /// Token minting request timeout (ms)
    pub const TOKEN_REQUEST_MS: u64 = 5_000;
}

/// Start circuit breaker defaults
pub mod breaker {
    /// Consecutive start failures before the breaker opens
    pub const FAILURE_THRESHOLD: u32 = 3;

    /// How long the breaker stays open once tripped (seconds)
    pub const COOLDOWN_SECS: u64 = 30;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_window_within_band() {
        assert!(session::COMPLETION_FALLBACK_MS >= session::COMPLETION_FALLBACK_MIN_MS);
        assert!(session::COMPLETION_FALLBACK_MS <= session::COMPLETION_FALLBACK_MAX_MS);
    }

    #[test]
    fn test_debounce_shorter_than_fallback() {
        assert!(session::START_DEBOUNCE_MS < session::COMPLETION_FALLBACK_MIN_MS);
    }

    #[test]
    fn test_audio_frame_divides_evenly() {
        // Opus accepts 2.5/5/10/20/40/60ms frames; sample counts must be whole.
        assert_eq!((audio::MIC_SAMPLE_RATE_HZ * audio::MIC_FRAME_MS) % 1000, 0);
    }
}
