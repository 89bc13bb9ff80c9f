use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

pub mod backoff;
pub mod body;
pub mod config;
pub mod discovery;
pub mod echo;
pub mod emoji;
pub mod events;
pub mod ingest;
pub mod manager;
pub mod outbound;
pub mod reactions;
pub mod receipts;
pub mod remote;
pub mod scheduler;
pub mod session;

pub use backoff::{BackoffPolicy, BackoffReason, PollBackoff, PollOutcome};
pub use config::{BridgeConfig, EngineConfig};
pub use events::{BridgeEvent, ChannelSink, EventSink, JsonLineSink, RoomType};
pub use manager::SessionManager;
pub use outbound::SentMessage;
pub use remote::{HttpRemoteClient, RemoteClient, RemoteError};
pub use scheduler::{PollScheduler, SchedulerConfig, SchedulerStats};
pub use session::{ClientFactory, Session, SessionError, SessionExit, SessionState};

pub use tether_auth::{Credentials, CredentialStore, OAuthExchange, TokenManager};
pub use tether_store::{Store, ThreadRecord};

#[derive(Debug, Clone)]
pub struct TetherPaths {
    pub base_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
}

impl TetherPaths {
    pub fn from_env() -> Self {
        if let Some(dir) = std::env::var_os("TETHER_DATA_DIR") {
            return Self::from_base(PathBuf::from(dir));
        }
        if let Some(home) = std::env::var_os("HOME") {
            return Self::from_base(PathBuf::from(home).join(".tether"));
        }
        Self::from_base(PathBuf::from(".tether"))
    }

    pub fn from_base(base_dir: PathBuf) -> Self {
        let db_path = base_dir.join("tether.db");
        let config_path = base_dir.join("tether.toml");
        Self {
            base_dir,
            db_path,
            config_path,
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }
}

/// Credential and thread overview of one account.
#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    pub account_id: String,
    pub remote_id: String,
    pub has_refresh_token: bool,
    pub session_expires_at: Option<DateTime<Utc>>,
    pub threads: Vec<ThreadRecord>,
}

/// Opened store plus configuration; builds sessions.
#[derive(Clone)]
pub struct Tether {
    pub config: BridgeConfig,
    pub store: Store,
}

impl Tether {
    pub async fn init(paths: &TetherPaths) -> Result<Self> {
        paths.ensure_dirs()?;
        let config = BridgeConfig::load(&paths.config_path)?;
        let store = Store::new(&paths.db_path)
            .await
            .with_context(|| format!("opening {}", paths.db_path.display()))?;
        Ok(Self { config, store })
    }

    pub async fn accounts(&self) -> Result<Vec<String>> {
        self.store.list_accounts().await
    }

    /// Store a fresh refresh credential for `account_id`, replacing anything
    /// previously stored.
    pub async fn login(&self, account_id: &str, refresh_token: &str) -> Result<()> {
        let account_id = account_id.trim();
        let refresh_token = refresh_token.trim();
        if account_id.is_empty() {
            bail!("account id must not be empty");
        }
        if refresh_token.is_empty() {
            bail!("refresh credential must not be empty");
        }
        CredentialStore::save(&self.store, account_id, &Credentials::with_refresh_token(refresh_token)).await?;
        info!("Stored credentials for {}", account_id);
        Ok(())
    }

    pub async fn logout(&self, account_id: &str) -> Result<bool> {
        self.store.delete_credentials(account_id).await
    }

    pub async fn status(&self) -> Result<Vec<AccountStatus>> {
        let mut statuses = Vec::new();
        for account_id in self.accounts().await? {
            let credentials = CredentialStore::load(&self.store, &account_id)
                .await?
                .unwrap_or_default();
            statuses.push(AccountStatus {
                threads: self.store.list_threads(&account_id).await?,
                has_refresh_token: credentials.refresh_token.as_deref().is_some_and(|t| !t.is_empty()),
                session_expires_at: credentials.session_expires_at,
                remote_id: credentials.remote_id,
                account_id,
            });
        }
        Ok(statuses)
    }

    /// Wire a session for `account_id` against the configured endpoints.
    pub async fn build_session(&self, account_id: &str, sink: Arc<dyn EventSink>) -> Result<Arc<Session>> {
        let engine = self.config.engine();
        let exchange = Arc::new(OAuthExchange::new(self.config.exchange()?)?);
        let tokens = TokenManager::load(account_id, exchange, Arc::new(self.store.clone()), engine.token_skew).await?;

        let base_url = self.config.remote.api_base_url.clone();
        let timeout = self.config.request_timeout();
        let factory: ClientFactory = Arc::new(move || {
            let client: Arc<dyn RemoteClient> = Arc::new(HttpRemoteClient::new(&base_url, timeout)?);
            Ok(client)
        });

        Ok(Arc::new(Session::new(
            Arc::new(tokens),
            self.store.clone(),
            sink,
            factory,
            engine,
        )))
    }
}
