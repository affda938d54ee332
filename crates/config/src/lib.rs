//! Configuration management for the session manager
//!
//! Supports loading configuration from:
//! - TOML files under config/
//! - Environment variables (COLLOQUY_ prefix)
//!
//! Values not present in any source fall back to the defaults in
//! [`constants`], so the daemon starts with zero configuration files.

pub mod constants;
pub mod settings;

pub use settings::{
    load_settings, IceServerSettings, ObservabilityConfig, RealtimeApiConfig, RuntimeEnvironment,
    ServerConfig, SessionTuning, Settings, TokenServiceConfig, TransportSettings,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}
