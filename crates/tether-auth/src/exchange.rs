use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use oauth2::{
    basic::BasicClient, AuthType, ClientId, EndpointNotSet, EndpointSet, RefreshToken,
    RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::{AccessGrant, ExchangeError, SessionGrant, TokenExchange};

/// Lifetime assumed for an access credential that carries no expiry at all.
const FALLBACK_ACCESS_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub client_id: String,
    pub token_url: String,
    /// Endpoint that turns an access credential into a chat session token.
    pub session_url: String,
    /// Scope requested on plain refreshes.
    pub default_scope: Option<String>,
}

/// OAuth2 refresh plus the session-token call, over reqwest.
#[derive(Debug, Clone)]
pub struct OAuthExchange {
    http_client: Client,
    config: ExchangeConfig,
}

type ConfiguredClient = BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

impl OAuthExchange {
    pub fn new(config: ExchangeConfig) -> Result<Self> {
        let http_client = Client::builder()
            .redirect(Policy::none())
            .timeout(Duration::from_secs(30))
            .build()?;
        // Validate the token endpoint up front instead of on first refresh.
        build_client(&config)?;
        Ok(Self { http_client, config })
    }
}

fn build_client(config: &ExchangeConfig) -> Result<ConfiguredClient> {
    let token_url = TokenUrl::new(config.token_url.clone())
        .map_err(|_| anyhow!("invalid token_url"))?;
    Ok(BasicClient::new(ClientId::new(config.client_id.clone()))
        .set_auth_type(AuthType::RequestBody)
        .set_token_uri(token_url))
}

#[async_trait]
impl TokenExchange for OAuthExchange {
    async fn refresh_access(
        &self,
        refresh_token: &str,
        scope: Option<&str>,
    ) -> Result<AccessGrant, ExchangeError> {
        let client = build_client(&self.config).map_err(|e| ExchangeError::Malformed(e.to_string()))?;
        let refresh = RefreshToken::new(refresh_token.to_string());
        let mut req = client.exchange_refresh_token(&refresh);
        if let Some(scope) = scope.or(self.config.default_scope.as_deref()) {
            req = req.add_scope(Scope::new(scope.to_string()));
        }

        let token = req
            .request_async(&self.http_client)
            .await
            .map_err(classify_token_error)?;

        let access_token = token.access_token().secret().to_string();
        let expires_at = token
            .expires_in()
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d)
            .or_else(|| jwt_expiry(&access_token))
            .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(FALLBACK_ACCESS_LIFETIME_SECS));

        debug!(
            "refreshed access credential (scope: {:?}, length: {})",
            scope,
            access_token.len()
        );
        Ok(AccessGrant {
            access_token,
            refresh_token: token.refresh_token().map(|t| t.secret().to_string()),
            expires_at,
        })
    }

    async fn acquire_session(&self, access_token: &str) -> Result<SessionGrant, ExchangeError> {
        let response = self
            .http_client
            .post(&self.config.session_url)
            .header("Authorization", format!("Bearer {}", access_token))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ExchangeError::RateLimited {
                retry_after: retry_after(&response),
            });
        }
        if status.is_server_error() {
            return Err(ExchangeError::Transient(format!("session endpoint returned {}", status)));
        }
        if !status.is_success() {
            return Err(ExchangeError::Rejected {
                status: Some(status.as_u16()),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let envelope: SessionEnvelope = response
            .json()
            .await
            .map_err(|e| ExchangeError::Malformed(e.to_string()))?;
        let payload = envelope.session_token;
        let remote_id = payload
            .identity
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ExchangeError::Malformed("session response has no identity".to_string()))?;
        let expires_at = payload
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs))
            .or_else(|| jwt_expiry(&payload.token))
            .ok_or_else(|| ExchangeError::Malformed("session response has no expiry".to_string()))?;

        Ok(SessionGrant {
            session_token: payload.token,
            expires_at,
            remote_id,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionEnvelope {
    #[serde(alias = "skypeToken")]
    session_token: SessionPayload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionPayload {
    #[serde(alias = "skypetoken")]
    token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default, alias = "skypeid")]
    identity: Option<String>,
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn classify_token_error<RE, T>(err: RequestTokenError<RE, T>) -> ExchangeError
where
    RE: std::error::Error + 'static,
    T: oauth2::ErrorResponse + 'static,
{
    match err {
        RequestTokenError::ServerResponse(resp) => ExchangeError::Rejected {
            status: None,
            body: resp.to_string(),
        },
        RequestTokenError::Request(e) => ExchangeError::Transient(e.to_string()),
        RequestTokenError::Parse(e, _) => ExchangeError::Malformed(e.to_string()),
        RequestTokenError::Other(msg) => ExchangeError::Transient(msg),
    }
}

/// Read the `exp` claim of a JWT without verifying it.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    #[derive(Deserialize)]
    struct Claims {
        exp: i64,
    }

    let payload = token.split('.').nth(1)?;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Claims = serde_json::from_slice(&decoded).ok()?;
    DateTime::from_timestamp(claims.exp, 0)
}
