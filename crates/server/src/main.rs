//! Colloquy server entry point
//!
//! Wires configuration, the token provider, the WebRTC transport factory
//! and the session manager together, then serves the HTTP control surface
//! until SIGTERM/Ctrl+C.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use colloquy_config::{load_settings, Settings};
use colloquy_server::{create_router, init_metrics, AppState};
use colloquy_session::{HttpTokenProvider, SessionManager, SessionManagerConfig};
use colloquy_transport::{RealtimeTransportConfig, RealtimeTransportFactory, SilenceMicSource};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Priority: env vars > config/{env}.toml > config/default.toml > defaults
    let env = std::env::var("COLLOQUY_ENV").ok();
    let config = match load_settings(env.as_deref()) {
        Ok(settings) => {
            // Tracing not yet initialized, use eprintln for early logging
            eprintln!(
                "Loaded configuration from files (env: {})",
                env.as_deref().unwrap_or("default")
            );
            settings
        }
        Err(e) => {
            eprintln!("Warning: Failed to load config: {}. Using defaults.", e);
            Settings::default()
        }
    };

    init_tracing(&config);

    tracing::info!(
        "Starting Colloquy session service v{}",
        env!("CARGO_PKG_VERSION")
    );
    tracing::info!(
        environment = ?config.environment,
        config_path = env.as_deref().unwrap_or("default"),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled && init_metrics() {
        tracing::info!("Initialized Prometheus metrics at /metrics");
    }

    let tokens = Arc::new(HttpTokenProvider::from_settings(&config.token_service));

    // Headless capture source; a desktop embedding swaps in a real device.
    let mic = Arc::new(SilenceMicSource::new(
        config.transport.mic_sample_rate_hz,
        config.transport.mic_frame_ms,
    ));
    tracing::info!(
        sample_rate_hz = config.transport.mic_sample_rate_hz,
        frame_ms = config.transport.mic_frame_ms,
        "Using silence microphone source (headless mode)"
    );

    let transports = Arc::new(RealtimeTransportFactory::new(
        RealtimeTransportConfig::from_settings(&config),
        mic,
    ));
    let manager = SessionManager::new(
        SessionManagerConfig::from_settings(&config),
        tokens,
        transports,
    );

    let state = AppState::new(config.clone(), manager.clone());
    let app = create_router(state);

    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    tracing::info!("Listening on {}:{}", config.server.host, config.server.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Release the transport (and the microphone) before exiting.
    manager.destroy().await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

/// Initialize tracing from the environment, falling back to the configured
/// log level.
fn init_tracing(config: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.observability.log_level;
        format!("{},tower_http=debug", level).into()
    });

    let subscriber = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = if config.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    subscriber.with(fmt_layer).init();
}
