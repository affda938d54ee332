//! Ephemeral credential issuance
//!
//! The session manager never talks to the realtime API with a long-lived
//! key. Each connect asks the token service to mint a short-lived
//! credential scoped to a model, voice and instruction set. One request,
//! no retries; retry policy belongs to whoever drives the manager.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colloquy_config::TokenServiceConfig;
use colloquy_core::{ProficiencyLevel, ScenarioId, UserContext};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Token endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Token request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Token response carried no token")]
    MissingToken,
}

/// Body posted to the token minting endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub model: String,
    pub voice: String,
    pub instructions: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<ScenarioId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<ProficiencyLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserContext>,
}

/// Short-lived credential good for one transport connect.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeToken {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn request_token(&self, request: &TokenRequest) -> Result<RealtimeToken, TokenError>;
}

/// HTTP client for the token minting service.
pub struct HttpTokenProvider {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpTokenProvider {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &TokenServiceConfig) -> Self {
        Self::new(
            settings.endpoint.clone(),
            Duration::from_millis(settings.request_timeout_ms),
        )
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn request_token(&self, request: &TokenRequest) -> Result<RealtimeToken, TokenError> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let token: RealtimeToken = response.json().await?;
        if token.token.is_empty() {
            return Err(TokenError::MissingToken);
        }
        Ok(token)
    }
}

/// Hands out one fixed token. For local development against a stubbed
/// upstream, where minting real credentials would be noise.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn request_token(&self, _request: &TokenRequest) -> Result<RealtimeToken, TokenError> {
        Ok(RealtimeToken {
            token: self.token.clone(),
            expires_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let request = TokenRequest {
            model: "gpt-4o-realtime-preview".to_string(),
            voice: "verse".to_string(),
            instructions: "You are a friendly conversation partner.".to_string(),
            scenario_id: Some("ordering-food".into()),
            level: Some(ProficiencyLevel::Intermediate),
            user: Some(UserContext::named("Maya")),
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "gpt-4o-realtime-preview");
        assert_eq!(json["scenarioId"], "ordering-food");
        assert_eq!(json["level"], "intermediate");
        assert_eq!(json["user"]["displayName"], "Maya");
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let request = TokenRequest {
            model: "gpt-4o-realtime-preview".to_string(),
            voice: "verse".to_string(),
            instructions: String::new(),
            scenario_id: None,
            level: None,
            user: None,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("scenarioId").is_none());
        assert!(json.get("level").is_none());
        assert!(json.get("user").is_none());
    }

    #[test]
    fn test_token_response_parses_with_and_without_expiry() {
        let token: RealtimeToken =
            serde_json::from_str(r#"{"token":"ek_abc","expiresAt":"2025-06-01T12:00:00Z"}"#)
                .unwrap();
        assert_eq!(token.token, "ek_abc");
        assert!(token.expires_at.is_some());

        let bare: RealtimeToken = serde_json::from_str(r#"{"token":"ek_abc"}"#).unwrap();
        assert!(bare.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_static_provider_returns_fixed_token() {
        let provider = StaticTokenProvider::new("ek_dev");
        let request = TokenRequest {
            model: "m".to_string(),
            voice: "v".to_string(),
            instructions: String::new(),
            scenario_id: None,
            level: None,
            user: None,
        };
        let token = provider.request_token(&request).await.unwrap();
        assert_eq!(token.token, "ek_dev");
    }
}
