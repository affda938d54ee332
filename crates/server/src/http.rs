//! HTTP endpoints
//!
//! REST control surface for the session manager, plus the health,
//! readiness and metrics probes.

use std::time::Duration;

use axum::extract::{Json, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use colloquy_core::{ProficiencyLevel, SessionSnapshot, UserContext};
use colloquy_session::StartRequest;

use crate::metrics::metrics_handler;
use crate::state::AppState;
use crate::websocket::events_handler;
use crate::ServerError;

/// Outer bound on any single request. A start may legitimately wait out a
/// full transport connect, so this sits well above the connect timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let cors_layer = build_cors_layer(
        &state.config.server.cors_origins,
        state.config.server.cors_enabled,
    );

    Router::new()
        // Session lifecycle
        .route("/api/session/start", post(start_session))
        .route("/api/session/stop", post(stop_session))
        .route("/api/session/destroy", post(destroy_session))
        .route("/api/session", get(get_session))
        // Event stream
        .route("/api/session/events", get(events_handler))
        // Health probes
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        // Prometheus metrics
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(cors_layer)
        .with_state(state)
}

/// Build the CORS layer from configured origins
///
/// - If cors_enabled is false, returns a permissive layer (for dev)
/// - If no valid origins are configured, defaults to localhost:3000
fn build_cors_layer(origins: &[String], enabled: bool) -> CorsLayer {
    if !enabled {
        tracing::warn!("CORS is disabled - allowing all origins (NOT FOR PRODUCTION)");
        return CorsLayer::permissive();
    }

    let parsed_origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    if parsed_origins.is_empty() {
        if origins.is_empty() {
            tracing::info!("No CORS origins configured, defaulting to localhost:3000");
        } else {
            tracing::error!("All configured CORS origins are invalid, falling back to localhost");
        }
        return CorsLayer::new()
            .allow_origin(HeaderValue::from_static("http://localhost:3000"))
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE]);
    }

    tracing::info!("CORS configured with {} origins", parsed_origins.len());
    CorsLayer::new()
        .allow_origin(parsed_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

/// Start request payload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartSessionRequest {
    scenario_id: String,
    #[serde(default)]
    level: ProficiencyLevel,
    #[serde(default)]
    user: UserContext,
    /// Distinguishes user actions from programmatic restarts in logs
    #[serde(default)]
    user_initiated: bool,
}

/// Stop request payload; the body is optional and defaults to a
/// user-initiated stop.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopSessionRequest {
    #[serde(default = "default_by_user")]
    by_user: bool,
}

fn default_by_user() -> bool {
    true
}

/// Start a session (or fold the request into one already running)
async fn start_session(
    State(state): State<AppState>,
    Json(payload): Json<StartSessionRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    if payload.scenario_id.trim().is_empty() {
        return Err(ServerError::InvalidRequest(
            "scenarioId must not be empty".to_string(),
        ));
    }
    state.breaker.check().map_err(ServerError::StartSuppressed)?;

    let mut request = StartRequest::new(payload.scenario_id)
        .with_level(payload.level)
        .with_user(payload.user);
    if payload.user_initiated {
        request = request.user_initiated();
    }

    let started = state.manager.start_session(request).await;
    if started {
        state.breaker.record_success();
    } else {
        state.breaker.record_failure();
    }

    Ok(Json(serde_json::json!({
        "started": started,
        "state": state.manager.snapshot(),
    })))
}

/// Stop the current session
async fn stop_session(
    State(state): State<AppState>,
    payload: Option<Json<StopSessionRequest>>,
) -> Json<serde_json::Value> {
    let by_user = payload.map(|Json(p)| p.by_user).unwrap_or(true);
    state.manager.stop_session(by_user).await;
    Json(serde_json::json!({ "state": state.manager.snapshot() }))
}

/// Hard reset of the session manager
async fn destroy_session(State(state): State<AppState>) -> StatusCode {
    state.manager.destroy().await;
    StatusCode::NO_CONTENT
}

/// Current session snapshot
async fn get_session(State(state): State<AppState>) -> Json<SessionSnapshot> {
    Json(state.manager.snapshot())
}

/// Liveness probe
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0);
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": uptime_secs,
            "phase": state.manager.snapshot().phase,
        })),
    )
}

/// Readiness probe; not ready while the start breaker is open
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let mut checks = serde_json::Map::new();
    let mut ready = true;

    let breaker_open = state.breaker.is_open();
    if breaker_open {
        ready = false;
    }
    checks.insert(
        "start_breaker".to_string(),
        serde_json::json!({
            "status": if breaker_open { "open" } else { "closed" }
        }),
    );

    let snapshot = state.manager.snapshot();
    checks.insert(
        "session".to_string(),
        serde_json::json!({
            "status": "ok",
            "phase": snapshot.phase,
            "scenario": snapshot.scenario,
        }),
    );

    let status = if ready { "ready" } else { "not_ready" };
    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(serde_json::json!({
            "status": status,
            "checks": checks,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use colloquy_config::Settings;
    use colloquy_session::testing::{ScriptedTokenProvider, ScriptedTransportFactory};
    use colloquy_session::{SessionManager, SessionManagerConfig};
    use tower::ServiceExt;

    fn scripted_state(settings: Settings) -> (AppState, Arc<ScriptedTransportFactory>) {
        let factory = Arc::new(ScriptedTransportFactory::new());
        let manager = SessionManager::new(
            SessionManagerConfig::from_settings(&settings),
            Arc::new(ScriptedTokenProvider::new("ek_test")),
            factory.clone(),
        );
        (AppState::new(settings, manager), factory)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_router_creation() {
        let (state, _factory) = scripted_state(Settings::default());
        let _ = create_router(state);
    }

    #[tokio::test]
    async fn test_health_reports_ok_and_phase() {
        let (state, _factory) = scripted_state(Settings::default());
        let app = create_router(state);

        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["phase"], "idle");
    }

    #[tokio::test]
    async fn test_start_endpoint_establishes_session() {
        let (state, factory) = scripted_state(Settings::default());
        let app = create_router(state);

        let response = app
            .oneshot(post_json(
                "/api/session/start",
                r#"{"scenarioId":"greetings","level":"advanced","userInitiated":true}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["started"], true);
        assert_eq!(json["state"]["phase"], "connected");
        assert_eq!(json["state"]["scenario"], "greetings");
        assert_eq!(factory.connects(), 1);
    }

    #[tokio::test]
    async fn test_start_endpoint_rejects_blank_scenario() {
        let (state, factory) = scripted_state(Settings::default());
        let app = create_router(state);

        let response = app
            .oneshot(post_json("/api/session/start", r#"{"scenarioId":"  "}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(factory.connects(), 0);
    }

    #[tokio::test]
    async fn test_stop_without_body_is_user_stop() {
        let (state, factory) = scripted_state(Settings::default());
        let app = create_router(state);

        let started = app
            .clone()
            .oneshot(post_json(
                "/api/session/start",
                r#"{"scenarioId":"greetings"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(started.status(), StatusCode::OK);

        let response = app.oneshot(post_empty("/api/session/stop")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["state"]["phase"], "idle");
        assert_eq!(json["state"]["flags"]["user_ended_session"], true);
        assert_eq!(factory.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_destroy_returns_no_content() {
        let (state, _factory) = scripted_state(Settings::default());
        let app = create_router(state);

        let response = app
            .oneshot(post_empty("/api/session/destroy"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_open_breaker_suppresses_start_and_fails_readiness() {
        let mut settings = Settings::default();
        settings.server.start_failure_threshold = 1;
        let (state, factory) = scripted_state(settings);
        let app = create_router(state.clone());

        state.breaker.record_failure();

        let ready = app.clone().oneshot(get_request("/ready")).await.unwrap();
        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(ready).await;
        assert_eq!(json["status"], "not_ready");
        assert_eq!(json["checks"]["start_breaker"]["status"], "open");

        let response = app
            .oneshot(post_json(
                "/api/session/start",
                r#"{"scenarioId":"greetings"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
        assert_eq!(factory.connects(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_endpoint_serializes_idle_state() {
        let (state, _factory) = scripted_state(Settings::default());
        let app = create_router(state);

        let response = app.oneshot(get_request("/api/session")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["phase"], "idle");
        assert!(json.get("scenario").is_none());
    }
}
