//! Credential lifecycle for a logged-in account.
//!
//! The chain is: long-lived refresh credential -> access credential ->
//! session token (chat API) plus any number of audience-scoped tokens.
//! [`TokenManager`] refreshes each link only when it is about to expire and
//! persists every refresh before handing the token out.

mod exchange;

pub use exchange::{jwt_expiry, ExchangeConfig, OAuthExchange};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use tether_store::Store;

/// Everything needed to resume a session without re-authenticating.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub access_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub session_expires_at: Option<DateTime<Utc>>,
    /// Audience-scoped tokens keyed by audience.
    #[serde(default)]
    pub scoped: BTreeMap<String, ScopedToken>,
    /// Canonical remote identity of the account.
    #[serde(default)]
    pub remote_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credentials {
    pub fn with_refresh_token(refresh_token: impl Into<String>) -> Self {
        Self {
            refresh_token: Some(refresh_token.into()),
            ..Self::default()
        }
    }

    fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// The cached session token, if it outlives `now + skew`.
    pub fn valid_session(&self, now: DateTime<Utc>, skew: chrono::Duration) -> Option<&str> {
        match (&self.session_token, self.session_expires_at) {
            (Some(token), Some(exp)) if !token.is_empty() && usable(exp, now, skew) => Some(token),
            _ => None,
        }
    }

    fn valid_access(&self, now: DateTime<Utc>, skew: chrono::Duration) -> Option<&str> {
        match (&self.access_token, self.access_expires_at) {
            (Some(token), Some(exp)) if !token.is_empty() && usable(exp, now, skew) => Some(token),
            _ => None,
        }
    }

    fn valid_scoped(&self, audience: &str, now: DateTime<Utc>, skew: chrono::Duration) -> Option<&str> {
        self.scoped
            .get(audience)
            .filter(|t| !t.token.is_empty() && usable(t.expires_at, now, skew))
            .map(|t| t.token.as_str())
    }

    fn absorb_rotated_refresh(&mut self, rotated: Option<String>) {
        if let Some(rotated) = rotated.filter(|t| !t.is_empty()) {
            self.refresh_token = Some(rotated);
        }
    }
}

fn usable(expires_at: DateTime<Utc>, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
    now + skew < expires_at
}

/// Result of exchanging the refresh credential.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub access_token: String,
    /// Present when the remote rotated the refresh credential.
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Result of exchanging an access credential for a chat-API session token.
#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
    pub remote_id: String,
}

/// A session token handed to callers together with the identity it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionToken {
    pub token: String,
    pub remote_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExchangeError {
    #[error("credential exchange rejected (status {status:?}): {body}")]
    Rejected { status: Option<u16>, body: String },
    #[error("credential exchange rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("credential exchange failed: {0}")]
    Transient(String),
    #[error("malformed credential exchange response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("re-authentication required: {0}")]
    ReauthRequired(String),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

impl AuthError {
    /// Fatal errors cannot be fixed by retrying; the user has to log in again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AuthError::ReauthRequired(_) | AuthError::Exchange(ExchangeError::Rejected { .. })
        )
    }
}

/// Remote calls that turn one credential into the next.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Exchange the refresh credential for an access credential, optionally
    /// scoped to an audience.
    async fn refresh_access(
        &self,
        refresh_token: &str,
        scope: Option<&str>,
    ) -> std::result::Result<AccessGrant, ExchangeError>;

    async fn acquire_session(&self, access_token: &str) -> std::result::Result<SessionGrant, ExchangeError>;
}

/// Durable home for per-account credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, account_id: &str) -> Result<Option<Credentials>>;
    async fn save(&self, account_id: &str, credentials: &Credentials) -> Result<()>;
}

#[async_trait]
impl CredentialStore for Store {
    async fn load(&self, account_id: &str) -> Result<Option<Credentials>> {
        match self.load_credentials(account_id).await? {
            Some(blob) => Ok(Some(serde_json::from_str(&blob)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, account_id: &str, credentials: &Credentials) -> Result<()> {
        let blob = serde_json::to_string(credentials)?;
        self.save_credentials(account_id, &blob).await
    }
}

/// Owns the credential chain of one account.
///
/// All refreshes go through one async mutex, so concurrent callers that
/// find an expired token wait for a single exchange instead of racing.
pub struct TokenManager {
    account_id: String,
    exchange: Arc<dyn TokenExchange>,
    store: Arc<dyn CredentialStore>,
    skew: chrono::Duration,
    state: Mutex<Credentials>,
}

impl TokenManager {
    pub fn new(
        account_id: impl Into<String>,
        credentials: Credentials,
        exchange: Arc<dyn TokenExchange>,
        store: Arc<dyn CredentialStore>,
        skew: Duration,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            exchange,
            store,
            skew: chrono::Duration::from_std(skew).unwrap_or_else(|_| chrono::Duration::seconds(60)),
            state: Mutex::new(credentials),
        }
    }

    /// Build a manager from whatever the store holds for `account_id`.
    pub async fn load(
        account_id: &str,
        exchange: Arc<dyn TokenExchange>,
        store: Arc<dyn CredentialStore>,
        skew: Duration,
    ) -> Result<Self> {
        let credentials = store.load(account_id).await?.unwrap_or_default();
        Ok(Self::new(account_id, credentials, exchange, store, skew))
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub async fn snapshot(&self) -> Credentials {
        self.state.lock().await.clone()
    }

    /// Return a session token valid for at least the configured skew,
    /// refreshing the chain if needed. No I/O happens while the cached
    /// token is still good.
    pub async fn ensure_session_token(&self) -> std::result::Result<SessionToken, AuthError> {
        let mut creds = self.state.lock().await;
        let now = Utc::now();

        if let (Some(token), Some(expires_at)) = (creds.valid_session(now, self.skew), creds.session_expires_at) {
            return Ok(SessionToken {
                token: token.to_string(),
                remote_id: creds.remote_id.clone(),
                expires_at,
            });
        }

        let access_token = match creds.valid_access(now, self.skew) {
            Some(token) => token.to_string(),
            None => {
                let refresh = self.require_refresh(&creds)?;
                info!("[AUTH] Refreshing access credential for {}", self.account_id);
                let grant = self.exchange.refresh_access(&refresh, None).await?;
                creds.absorb_rotated_refresh(grant.refresh_token);
                creds.access_token = Some(grant.access_token.clone());
                creds.access_expires_at = Some(grant.expires_at);
                // A rotated refresh credential may already be the only valid one.
                self.persist(&creds).await;
                grant.access_token
            }
        };

        info!("[AUTH] Acquiring session token for {}", self.account_id);
        let session = self.exchange.acquire_session(&access_token).await?;
        creds.session_token = Some(session.session_token.clone());
        creds.session_expires_at = Some(session.expires_at);
        if !session.remote_id.is_empty() {
            creds.remote_id = session.remote_id;
        }

        self.persist(&creds).await;
        info!(
            "[AUTH] Session token for {} valid until {}",
            self.account_id, session.expires_at
        );

        Ok(SessionToken {
            token: session.session_token,
            remote_id: creds.remote_id.clone(),
            expires_at: session.expires_at,
        })
    }

    /// Return a token for `audience`, refreshing only that token. Deployments
    /// that reject scope hints get a default-scope exchange instead.
    pub async fn ensure_scoped_token(&self, audience: &str) -> std::result::Result<String, AuthError> {
        let mut creds = self.state.lock().await;
        let now = Utc::now();

        if let Some(token) = creds.valid_scoped(audience, now, self.skew) {
            return Ok(token.to_string());
        }

        let refresh = self.require_refresh(&creds)?;
        let grant = match self.exchange.refresh_access(&refresh, Some(audience)).await {
            Ok(grant) => grant,
            Err(ExchangeError::Rejected { body, .. }) => {
                warn!(
                    "[AUTH] Scoped exchange for {} rejected ({}), retrying with default scope",
                    audience, body
                );
                self.exchange.refresh_access(&refresh, None).await?
            }
            Err(err) => return Err(err.into()),
        };

        creds.absorb_rotated_refresh(grant.refresh_token);
        creds.scoped.insert(
            audience.to_string(),
            ScopedToken {
                token: grant.access_token.clone(),
                expires_at: grant.expires_at,
            },
        );
        self.persist(&creds).await;

        Ok(grant.access_token)
    }

    /// Forget the cached session token, e.g. after the chat API refused it.
    pub async fn invalidate_session(&self) {
        let mut creds = self.state.lock().await;
        creds.session_token = None;
        creds.session_expires_at = None;
    }

    fn require_refresh(&self, creds: &Credentials) -> std::result::Result<String, AuthError> {
        if !creds.has_refresh_token() {
            return Err(AuthError::ReauthRequired(format!(
                "no refresh credential stored for {}",
                self.account_id
            )));
        }
        Ok(creds.refresh_token.clone().unwrap_or_default())
    }

    async fn persist(&self, creds: &Credentials) {
        if let Err(err) = self.store.save(&self.account_id, creds).await {
            warn!(
                "[AUTH] Failed to persist credentials for {}: {}",
                self.account_id, err
            );
        }
    }
}
