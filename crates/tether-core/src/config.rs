//! Bridge configuration.
//!
//! Read from `tether.toml` in the data directory. Every key is optional; a
//! missing file yields the built-in defaults.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use tether_auth::ExchangeConfig;

use crate::backoff::BackoffPolicy;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub engine: EngineSection,
    pub remote: RemoteSection,
    pub auth: AuthSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub poll_base_secs: u64,
    pub idle_cap_secs: u64,
    pub failure_cap_secs: u64,
    pub wake_ceiling_secs: u64,
    pub discovery_interval_secs: u64,
    /// Minimum spacing between read-state polls of one thread.
    pub receipt_interval_secs: u64,
    pub token_skew_secs: u64,
    pub echo_ttl_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            poll_base_secs: 2,
            idle_cap_secs: 30,
            failure_cap_secs: 60,
            wake_ceiling_secs: 5,
            discovery_interval_secs: 20 * 60,
            receipt_interval_secs: 45,
            token_skew_secs: 60,
            echo_ttl_secs: 5 * 60,
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSection {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            api_base_url: "https://msgapi.teams.live.com/v1".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub client_id: String,
    pub token_url: String,
    /// Endpoint exchanging an access credential for a chat session token.
    pub session_url: String,
    pub default_scope: Option<String>,
    /// Audience of the file-API token.
    pub file_scope: Option<String>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            token_url: "https://login.live.com/oauth20_token.srf".to_string(),
            session_url: "https://teams.live.com/api/auth/v1.0/authz/consumer".to_string(),
            default_scope: None,
            file_scope: None,
        }
    }
}

/// Runtime knobs of one session, resolved from [`EngineSection`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub receipt_interval: Duration,
    pub token_skew: Duration,
    pub echo_ttl: Duration,
    pub shutdown_grace: Duration,
    pub file_scope: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        BridgeConfig::default().engine()
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_url("remote.api_base_url", &self.remote.api_base_url)?;
        check_url("auth.token_url", &self.auth.token_url)?;
        check_url("auth.session_url", &self.auth.session_url)?;

        let engine = &self.engine;
        if engine.poll_base_secs == 0 {
            bail!("engine.poll_base_secs must be at least 1");
        }
        if engine.idle_cap_secs < engine.poll_base_secs || engine.failure_cap_secs < engine.poll_base_secs {
            bail!("engine caps must not be below engine.poll_base_secs");
        }
        if engine.wake_ceiling_secs == 0 {
            bail!("engine.wake_ceiling_secs must be at least 1");
        }
        Ok(())
    }

    pub fn engine(&self) -> EngineConfig {
        let e = &self.engine;
        EngineConfig {
            scheduler: SchedulerConfig {
                backoff: BackoffPolicy {
                    base: Duration::from_secs(e.poll_base_secs),
                    idle_cap: Duration::from_secs(e.idle_cap_secs),
                    failure_cap: Duration::from_secs(e.failure_cap_secs),
                },
                wake_ceiling: Duration::from_secs(e.wake_ceiling_secs),
                discovery_interval: Duration::from_secs(e.discovery_interval_secs),
            },
            receipt_interval: Duration::from_secs(e.receipt_interval_secs),
            token_skew: Duration::from_secs(e.token_skew_secs),
            echo_ttl: Duration::from_secs(e.echo_ttl_secs),
            shutdown_grace: Duration::from_secs(e.shutdown_grace_secs),
            file_scope: self.auth.file_scope.clone(),
        }
    }

    /// Credential-exchange settings. Fails when no client id is configured.
    pub fn exchange(&self) -> Result<ExchangeConfig> {
        if self.auth.client_id.trim().is_empty() {
            bail!("auth.client_id is not configured");
        }
        Ok(ExchangeConfig {
            client_id: self.auth.client_id.clone(),
            token_url: self.auth.token_url.clone(),
            session_url: self.auth.session_url.clone(),
            default_scope: self.auth.default_scope.clone(),
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.request_timeout_secs.max(1))
    }
}

fn check_url(key: &str, value: &str) -> Result<()> {
    let url = Url::parse(value).with_context(|| format!("{} is not a valid URL: {}", key, value))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("{} must be an http(s) URL: {}", key, value);
    }
    Ok(())
}
