//! Home-side actions forwarded to the remote.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::emoji::key_for_emoji;
use crate::remote::RemoteResult;
use crate::session::{Session, SessionError, SessionResult};

/// Identifiers of a message we sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Copy)]
enum SendKind {
    Text,
    Gif,
}

impl Session {
    pub async fn send_message(&self, thread_id: &str, body: &str) -> SessionResult<SentMessage> {
        self.send(thread_id, body, SendKind::Text).await
    }

    pub async fn send_gif(&self, thread_id: &str, url: &str) -> SessionResult<SentMessage> {
        self.send(thread_id, url, SendKind::Gif).await
    }

    /// Register the correlation id before sending so the echo is recognised
    /// even if it is polled before the send call returns.
    async fn send(&self, thread_id: &str, payload: &str, kind: SendKind) -> SessionResult<SentMessage> {
        let token = self.token().await?;
        let client = self.client()?;

        let correlation_id = Uuid::new_v4().simple().to_string();
        self.echoes.register(&correlation_id);

        let result: RemoteResult<String> = match kind {
            SendKind::Text => {
                client
                    .send_message_with_id(&token.token, thread_id, payload, &token.remote_id, &correlation_id)
                    .await
            }
            SendKind::Gif => {
                client
                    .send_gif_with_id(&token.token, thread_id, payload, &token.remote_id, &correlation_id)
                    .await
            }
        };

        let message_id = match result {
            Ok(id) => id,
            Err(err) => {
                self.echoes.withdraw(&correlation_id);
                return Err(self.remote_failed(err).await);
            }
        };

        if let Err(err) = self
            .store
            .record_message(&self.account_id, thread_id, &message_id, Utc::now())
            .await
        {
            warn!("[SESSION] Failed to index sent message {}: {}", message_id, err);
        }
        info!("[SESSION] Sent {:?} {} to {}", kind, message_id, thread_id);

        Ok(SentMessage {
            message_id,
            correlation_id,
        })
    }

    pub async fn send_reaction(&self, thread_id: &str, message_id: &str, emoji: &str) -> SessionResult<()> {
        let key = key_for_emoji(emoji).ok_or_else(|| SessionError::UnmappedEmoji(emoji.to_string()))?;
        let token = self.token().await?;
        let client = self.client()?;
        if let Err(err) = client
            .add_reaction(&token.token, thread_id, message_id, key, Utc::now())
            .await
        {
            return Err(self.remote_failed(err).await);
        }
        Ok(())
    }

    pub async fn remove_reaction(&self, thread_id: &str, message_id: &str, emoji: &str) -> SessionResult<()> {
        let key = key_for_emoji(emoji).ok_or_else(|| SessionError::UnmappedEmoji(emoji.to_string()))?;
        let token = self.token().await?;
        let client = self.client()?;
        if let Err(err) = client
            .remove_reaction(&token.token, thread_id, message_id, key, Utc::now())
            .await
        {
            return Err(self.remote_failed(err).await);
        }
        Ok(())
    }

    /// Token for the file API, refreshed independently of the session token.
    pub async fn file_token(&self) -> SessionResult<String> {
        let scope = self
            .config
            .file_scope
            .as_deref()
            .ok_or_else(|| SessionError::Other(anyhow::anyhow!("auth.file_scope is not configured")))?;
        Ok(self.tokens.ensure_scoped_token(scope).await?)
    }
}
