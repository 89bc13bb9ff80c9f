//! Contract of the remote chat service as seen by the engine.
//!
//! The engine never talks HTTP directly; it calls a [`RemoteClient`] and
//! gets back typed data or a classified [`RemoteError`].

mod http;

pub use http::HttpRemoteClient;

use std::cmp::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backoff::PollOutcome;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// One conversation as listed by the remote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Id to use for message fetches when it differs from `id`.
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub members: Vec<Member>,
    /// Explicit one-to-one marker when the remote provides one.
    #[serde(default)]
    pub one_to_one_hint: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionUser {
    pub user_id: String,
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

/// All users that reacted with one emotion key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub key: String,
    pub users: Vec<ReactionUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub id: String,
    /// Ordering key; compared with [`compare_cursor`].
    pub sequence: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub sender_alt_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: String,
    /// Client-generated id of the send that produced this message, if any.
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub reactions: Vec<ReactionGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionHorizon {
    pub user_id: String,
    /// Raw `seq;time;message` blob.
    pub horizon: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("rate limited by remote")]
    RateLimited { retry_after: Option<Duration> },
    #[error("remote rejected the session token ({status})")]
    Unauthorized { status: u16 },
    #[error("remote client error {status}: {body}")]
    Client { status: u16, body: String },
    #[error("remote server error {status}")]
    Server { status: u16 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

impl RemoteError {
    /// How the poll backoff should treat this failure.
    pub fn outcome(&self) -> PollOutcome {
        match self {
            RemoteError::RateLimited {
                retry_after: Some(wait),
            } => PollOutcome::RetryAfter(*wait),
            RemoteError::RateLimited { retry_after: None } => PollOutcome::Retryable,
            // The token gets re-exchanged before the next attempt.
            RemoteError::Unauthorized { .. } => PollOutcome::Retryable,
            RemoteError::Client { .. } => PollOutcome::ClientError,
            RemoteError::Server { .. } | RemoteError::Transport(_) | RemoteError::Decode(_) => {
                PollOutcome::Retryable
            }
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RemoteError::Unauthorized { .. })
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn list_conversations(&self, token: &str) -> RemoteResult<Vec<Conversation>>;

    /// Messages with an ordering key after `cursor`, or the most recent page
    /// when no cursor is known.
    async fn list_messages(
        &self,
        token: &str,
        conversation_id: &str,
        cursor: Option<&str>,
    ) -> RemoteResult<Vec<RemoteMessage>>;

    async fn add_reaction(
        &self,
        token: &str,
        thread_id: &str,
        message_id: &str,
        emotion_key: &str,
        at: DateTime<Utc>,
    ) -> RemoteResult<()>;

    async fn remove_reaction(
        &self,
        token: &str,
        thread_id: &str,
        message_id: &str,
        emotion_key: &str,
        at: DateTime<Utc>,
    ) -> RemoteResult<()>;

    async fn get_consumption_horizons(&self, token: &str, thread_id: &str) -> RemoteResult<Vec<ConsumptionHorizon>>;

    async fn set_consumption_horizon(&self, token: &str, thread_id: &str, horizon: &str) -> RemoteResult<()>;

    /// Returns the remote message id assigned to the send.
    async fn send_message_with_id(
        &self,
        token: &str,
        thread_id: &str,
        body: &str,
        sender_id: &str,
        correlation_id: &str,
    ) -> RemoteResult<String>;

    async fn send_gif_with_id(
        &self,
        token: &str,
        thread_id: &str,
        url: &str,
        sender_id: &str,
        correlation_id: &str,
    ) -> RemoteResult<String>;
}

/// Strip the contact URL prefix and the `8:` type tag from a remote user id.
pub fn normalize_user_id(raw: &str) -> &str {
    let id = raw.trim();
    let id = match id.rfind("/contacts/") {
        Some(pos) => &id[pos + "/contacts/".len()..],
        None => id,
    };
    id.strip_prefix("8:").unwrap_or(id)
}

pub fn same_user(a: &str, b: &str) -> bool {
    let (a, b) = (normalize_user_id(a), normalize_user_id(b));
    !a.is_empty() && a.eq_ignore_ascii_case(b)
}

/// Cursors compare numerically when both are unsigned integers,
/// lexicographically otherwise.
pub fn compare_cursor(a: &str, b: &str) -> Ordering {
    match (a.parse::<u128>(), b.parse::<u128>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// Whether `candidate` is strictly after `stored`. Everything is after a
/// missing cursor.
pub fn cursor_is_after(candidate: &str, stored: Option<&str>) -> bool {
    match stored {
        None => true,
        Some(stored) => compare_cursor(candidate, stored) == Ordering::Greater,
    }
}
