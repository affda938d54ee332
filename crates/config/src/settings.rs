//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::constants::{audio, breaker, endpoints, session, timeouts, webrtc};
use crate::ConfigError;

/// Runtime environment enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    /// Development mode - relaxed validation, warnings only
    #[default]
    Development,
    /// Staging mode - stricter validation
    Staging,
    /// Production mode - all validations enforced
    Production,
}

impl RuntimeEnvironment {
    /// Check if this is a production environment
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    /// Check if strict validation should be applied
    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Production | Self::Staging)
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Runtime environment (development, staging, production)
    #[serde(default)]
    pub environment: RuntimeEnvironment,

    /// Upstream realtime speech API
    #[serde(default)]
    pub realtime: RealtimeApiConfig,

    /// Token minting service
    #[serde(default)]
    pub token_service: TokenServiceConfig,

    /// Session lifecycle tuning
    #[serde(default)]
    pub session: SessionTuning,

    /// WebRTC transport settings
    #[serde(default)]
    pub transport: TransportSettings,

    /// HTTP control surface
    #[serde(default)]
    pub server: ServerConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Upstream realtime speech API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeApiConfig {
    /// Base URL the SDP offer is posted to
    #[serde(default = "default_realtime_url")]
    pub base_url: String,

    /// Model requested when minting tokens
    #[serde(default = "default_model")]
    pub model: String,

    /// Assistant voice requested when minting tokens
    #[serde(default = "default_voice")]
    pub voice: String,

    /// Instruction template; `{scenario}` and `{level}` are substituted
    /// per session
    #[serde(default = "default_instructions_template")]
    pub instructions_template: String,
}

fn default_realtime_url() -> String {
    endpoints::REALTIME_DEFAULT.to_string()
}

fn default_model() -> String {
    "gpt-4o-realtime-preview".to_string()
}

fn default_voice() -> String {
    "verse".to_string()
}

fn default_instructions_template() -> String {
    "You are a friendly conversation partner for the scenario '{scenario}'. \
     Speak at a {level} proficiency level and keep replies short."
        .to_string()
}

impl Default for RealtimeApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_realtime_url(),
            model: default_model(),
            voice: default_voice(),
            instructions_template: default_instructions_template(),
        }
    }
}

/// Token minting service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenServiceConfig {
    /// Endpoint that mints short-lived realtime credentials
    #[serde(default = "default_token_endpoint")]
    pub endpoint: String,

    /// Per-request timeout (ms)
    #[serde(default = "default_token_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_token_endpoint() -> String {
    endpoints::TOKEN_SERVICE_DEFAULT.to_string()
}

fn default_token_timeout_ms() -> u64 {
    timeouts::TOKEN_REQUEST_MS
}

impl Default for TokenServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_token_endpoint(),
            request_timeout_ms: default_token_timeout_ms(),
        }
    }
}

/// Session lifecycle tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTuning {
    /// Debounce window for coalescing rapid start requests (ms)
    #[serde(default = "default_start_debounce_ms")]
    pub start_debounce_ms: u64,

    /// Fallback window after the last completion signal before a turn
    /// is force-completed (ms)
    #[serde(default = "default_completion_fallback_ms")]
    pub completion_fallback_ms: u64,

    /// Broadcast channel capacity for event subscribers
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_start_debounce_ms() -> u64 {
    session::START_DEBOUNCE_MS
}

fn default_completion_fallback_ms() -> u64 {
    session::COMPLETION_FALLBACK_MS
}

fn default_event_capacity() -> usize {
    session::EVENT_CHANNEL_CAPACITY
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            start_debounce_ms: default_start_debounce_ms(),
            completion_fallback_ms: default_completion_fallback_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// WebRTC transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// ICE servers for NAT traversal
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerSettings>,

    /// End-to-end connect timeout (seconds)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Data channel label the upstream API expects
    #[serde(default = "default_data_channel_label")]
    pub data_channel_label: String,

    /// Microphone capture sample rate (Hz)
    #[serde(default = "default_mic_sample_rate")]
    pub mic_sample_rate_hz: u32,

    /// Frame duration per encoded packet (ms)
    #[serde(default = "default_mic_frame_ms")]
    pub mic_frame_ms: u32,

    /// Opus target bitrate (bits/s)
    #[serde(default = "default_opus_bitrate")]
    pub opus_bitrate: i32,
}

/// ICE server entry (STUN, or TURN with credentials)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerSettings {
    /// Server URLs, e.g. "stun:stun.l.google.com:19302"
    pub urls: Vec<String>,

    /// Username for TURN authentication
    #[serde(default)]
    pub username: String,

    /// Credential for TURN authentication
    #[serde(default)]
    pub credential: String,
}

fn default_ice_servers() -> Vec<IceServerSettings> {
    vec![IceServerSettings {
        urls: vec![webrtc::DEFAULT_STUN_URL.to_string()],
        username: String::new(),
        credential: String::new(),
    }]
}

fn default_connect_timeout_secs() -> u64 {
    webrtc::CONNECT_TIMEOUT_SECS
}

fn default_data_channel_label() -> String {
    webrtc::DATA_CHANNEL_LABEL.to_string()
}

fn default_mic_sample_rate() -> u32 {
    audio::MIC_SAMPLE_RATE_HZ
}

fn default_mic_frame_ms() -> u32 {
    audio::MIC_FRAME_MS
}

fn default_opus_bitrate() -> i32 {
    audio::OPUS_BITRATE
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            connect_timeout_secs: default_connect_timeout_secs(),
            data_channel_label: default_data_channel_label(),
            mic_sample_rate_hz: default_mic_sample_rate(),
            mic_frame_ms: default_mic_frame_ms(),
            opus_bitrate: default_opus_bitrate(),
        }
    }
}

/// HTTP control surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// CORS allowed origins (empty = allow any)
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Consecutive start failures before the breaker opens
    #[serde(default = "default_start_failure_threshold")]
    pub start_failure_threshold: u32,

    /// How long the breaker stays open once tripped (seconds)
    #[serde(default = "default_start_cooldown_secs")]
    pub start_cooldown_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_start_failure_threshold() -> u32 {
    breaker::FAILURE_THRESHOLD
}

fn default_start_cooldown_secs() -> u64 {
    breaker::COOLDOWN_SECS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            start_failure_threshold: default_start_failure_threshold(),
            start_cooldown_secs: default_start_cooldown_secs(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON instead of human-readable lines
    #[serde(default)]
    pub log_json: bool,

    /// Expose the Prometheus scrape endpoint
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            metrics_enabled: default_true(),
        }
    }
}

impl Settings {
    /// Create default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_realtime()?;
        self.validate_session()?;
        self.validate_transport()?;
        self.validate_server()?;

        Ok(())
    }

    fn validate_realtime(&self) -> Result<(), ConfigError> {
        if self.realtime.model.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "realtime.model".to_string(),
                message: "Model must not be empty".to_string(),
            });
        }

        if self.token_service.endpoint.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "token_service.endpoint".to_string(),
                message: "Token service endpoint must not be empty".to_string(),
            });
        }

        if self.token_service.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "token_service.request_timeout_ms".to_string(),
                message: "Timeout must be positive".to_string(),
            });
        }

        Ok(())
    }

    fn validate_session(&self) -> Result<(), ConfigError> {
        let tuning = &self.session;

        // The fallback exists to catch a missing upstream signal, not to
        // race healthy turns. Keep it inside the supported band.
        if tuning.completion_fallback_ms < session::COMPLETION_FALLBACK_MIN_MS
            || tuning.completion_fallback_ms > session::COMPLETION_FALLBACK_MAX_MS
        {
            return Err(ConfigError::InvalidValue {
                field: "session.completion_fallback_ms".to_string(),
                message: format!(
                    "Must be between {} and {}, got {}",
                    session::COMPLETION_FALLBACK_MIN_MS,
                    session::COMPLETION_FALLBACK_MAX_MS,
                    tuning.completion_fallback_ms
                ),
            });
        }

        if tuning.start_debounce_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "session.start_debounce_ms".to_string(),
                message: "Debounce window must be positive".to_string(),
            });
        }

        if tuning.start_debounce_ms >= tuning.completion_fallback_ms {
            return Err(ConfigError::InvalidValue {
                field: "session.start_debounce_ms".to_string(),
                message: format!(
                    "Debounce window must be shorter than the completion fallback ({}ms)",
                    tuning.completion_fallback_ms
                ),
            });
        }

        if tuning.event_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "session.event_capacity".to_string(),
                message: "Event channel capacity must be positive".to_string(),
            });
        }

        Ok(())
    }

    fn validate_transport(&self) -> Result<(), ConfigError> {
        let transport = &self.transport;

        if transport.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "transport.connect_timeout_secs".to_string(),
                message: "Connect timeout must be positive".to_string(),
            });
        }

        if transport.data_channel_label.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "transport.data_channel_label".to_string(),
                message: "Data channel label must not be empty".to_string(),
            });
        }

        // Opus frame sizes the encoder accepts
        if !matches!(transport.mic_frame_ms, 10 | 20 | 40 | 60) {
            return Err(ConfigError::InvalidValue {
                field: "transport.mic_frame_ms".to_string(),
                message: format!(
                    "Must be one of 10, 20, 40, 60, got {}",
                    transport.mic_frame_ms
                ),
            });
        }

        if transport.mic_sample_rate_hz == 0 {
            return Err(ConfigError::InvalidValue {
                field: "transport.mic_sample_rate_hz".to_string(),
                message: "Sample rate must be positive".to_string(),
            });
        }

        for (i, server) in transport.ice_servers.iter().enumerate() {
            if server.urls.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("transport.ice_servers[{}].urls", i),
                    message: "ICE server entry has no URLs".to_string(),
                });
            }
        }

        Ok(())
    }

    fn validate_server(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.port".to_string(),
                message: "Port cannot be 0".to_string(),
            });
        }

        if self.server.start_failure_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.start_failure_threshold".to_string(),
                message: "Failure threshold cannot be 0".to_string(),
            });
        }

        Ok(())
    }
}

/// Load settings from files and environment
///
/// Priority (highest to lowest):
/// 1. Environment variables (COLLOQUY_ prefix)
/// 2. config/{env}.toml (if env specified)
/// 3. config/default.toml
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    // Load default config
    builder = builder.add_source(File::with_name("config/default").required(false));

    // Load environment-specific config
    if let Some(env_name) = env {
        builder =
            builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    // Load from environment variables
    builder = builder.add_source(
        Environment::with_prefix("COLLOQUY")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    // Validate
    settings.validate()?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.session.start_debounce_ms, 500);
        assert_eq!(settings.transport.data_channel_label, "oai-events");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_fallback_window_validation() {
        let mut settings = Settings::default();

        // Below the band
        settings.session.completion_fallback_ms = 5_000;
        assert!(settings.validate().is_err());

        // Above the band
        settings.session.completion_fallback_ms = 15_000;
        assert!(settings.validate().is_err());

        // Inside the band
        settings.session.completion_fallback_ms = 8_500;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_debounce_validation() {
        let mut settings = Settings::default();

        settings.session.start_debounce_ms = 0;
        assert!(settings.validate().is_err());

        // Debounce must stay below the fallback window
        settings.session.start_debounce_ms = settings.session.completion_fallback_ms;
        assert!(settings.validate().is_err());

        settings.session.start_debounce_ms = 250;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_transport_validation() {
        let mut settings = Settings::default();

        settings.transport.mic_frame_ms = 15;
        assert!(settings.validate().is_err());
        settings.transport.mic_frame_ms = 20;

        settings.transport.connect_timeout_secs = 0;
        assert!(settings.validate().is_err());
        settings.transport.connect_timeout_secs = 30;

        settings.transport.ice_servers = vec![IceServerSettings {
            urls: vec![],
            username: String::new(),
            credential: String::new(),
        }];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_server_validation() {
        let mut settings = Settings::default();

        settings.server.port = 0;
        assert!(settings.validate().is_err());
        settings.server.port = 8080;

        settings.server.start_failure_threshold = 0;
        assert!(settings.validate().is_err());
        settings.server.start_failure_threshold = 3;

        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            environment = "production"

            [server]
            port = 9090

            [realtime]
            voice = "alloy"
            "#,
        )
        .unwrap();

        assert!(settings.environment.is_production());
        assert_eq!(settings.server.port, 9090);
        assert_eq!(settings.realtime.voice, "alloy");
        // Untouched sections keep their defaults
        assert_eq!(settings.session.completion_fallback_ms, 9_000);
        assert_eq!(settings.transport.mic_sample_rate_hz, 48_000);
        assert!(settings.validate().is_ok());
    }
}
