//! Message ingestion for one thread.
//!
//! Fetches everything after the stored cursor, emits each message once,
//! swallows our own echoes, and moves the cursor forward only.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use tether_store::ThreadRecord;

use crate::body::html_to_text;
use crate::events::{BridgeEvent, MessageEvent};
use crate::remote::{compare_cursor, cursor_is_after, normalize_user_id, same_user, RemoteMessage};
use crate::session::{Session, SessionResult};

/// In-memory cursors. They stay ahead of the database when a cursor write
/// fails, so ingestion keeps moving forward.
#[derive(Debug, Default)]
pub struct CursorCache {
    cursors: Mutex<HashMap<String, String>>,
}

impl CursorCache {
    fn cursors(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.cursors.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The later of the cached and the persisted cursor.
    pub fn effective(&self, thread_id: &str, persisted: Option<&str>) -> Option<String> {
        let cached = self.cursors().get(thread_id).cloned();
        match (cached, persisted) {
            (Some(cached), Some(persisted)) => {
                if compare_cursor(&cached, persisted) == Ordering::Less {
                    Some(persisted.to_string())
                } else {
                    Some(cached)
                }
            }
            (Some(cached), None) => Some(cached),
            (None, persisted) => persisted.map(str::to_string),
        }
    }

    pub fn advance(&self, thread_id: &str, cursor: &str) {
        let mut cursors = self.cursors();
        let newer = cursors
            .get(thread_id)
            .map_or(true, |current| cursor_is_after(cursor, Some(current.as_str())));
        if newer {
            cursors.insert(thread_id.to_string(), cursor.to_string());
        }
    }
}

/// Home-side ordering keys: the message timestamp in milliseconds, bumped
/// so that keys strictly increase within a session.
#[derive(Debug, Default)]
pub struct StreamOrder {
    last: AtomicI64,
}

impl StreamOrder {
    pub fn next(&self, timestamp: DateTime<Utc>) -> i64 {
        let wanted = timestamp.timestamp_millis();
        let mut assigned = wanted;
        let _ = self
            .last
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |last| {
                assigned = wanted.max(last + 1);
                Some(assigned)
            });
        assigned
    }
}

/// Display name for a sender: primary name, then the secondary one, then
/// the bare id.
pub fn sender_display_name(message: &RemoteMessage) -> String {
    let usable = |name: &Option<String>| {
        name.as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
    };
    usable(&message.sender_name)
        .or_else(|| usable(&message.sender_alt_name))
        .unwrap_or_else(|| normalize_user_id(&message.sender_id).to_string())
}

impl Session {
    /// Ingest everything new in `thread`. Returns the number of new
    /// messages, including suppressed echoes.
    pub async fn poll_thread(&self, thread: &ThreadRecord) -> SessionResult<usize> {
        let stored = self
            .cursors
            .effective(&thread.thread_id, thread.last_cursor.as_deref());

        let token = self.token().await?;
        let client = self.client()?;
        let mut messages = match client
            .list_messages(&token.token, &thread.conversation_id, stored.as_deref())
            .await
        {
            Ok(messages) => messages,
            Err(err) => return Err(self.remote_failed(err).await),
        };
        messages.sort_by(|a, b| compare_cursor(&a.sequence, &b.sequence));

        let mut newest: Option<(String, DateTime<Utc>)> = None;
        let mut ingested = 0;
        for message in &messages {
            if message.id.is_empty() {
                continue;
            }

            if cursor_is_after(&message.sequence, stored.as_deref()) {
                self.ingest_message(thread, message, &token.remote_id).await;
                ingested += 1;
                let advance = newest
                    .as_ref()
                    .map_or(true, |(cursor, _)| cursor_is_after(&message.sequence, Some(cursor.as_str())));
                if advance {
                    newest = Some((message.sequence.clone(), message.timestamp));
                }
            }

            // Reactions change after first delivery, so old messages are
            // reconciled too.
            if let Err(err) = self.reconcile_reactions(&thread.thread_id, message).await {
                warn!("[SESSION] Reaction sync for {} failed: {}", message.id, err);
            }
        }

        if let Some((cursor, ts)) = newest {
            self.cursors.advance(&thread.thread_id, &cursor);
            if let Err(err) = self
                .store
                .set_thread_cursor(&self.account_id, &thread.thread_id, &cursor, Some(ts))
                .await
            {
                warn!("[SESSION] Failed to persist cursor for {}: {}", thread.thread_id, err);
            }
        }

        if ingested > 0 {
            debug!("[SESSION] {} new messages in {}", ingested, thread.thread_id);
        }
        Ok(ingested)
    }

    async fn ingest_message(&self, thread: &ThreadRecord, message: &RemoteMessage, self_id: &str) {
        let sender_id = normalize_user_id(&message.sender_id).to_string();
        let sender_name = sender_display_name(message);
        let from_self = same_user(&sender_id, self_id);

        if !sender_id.is_empty() {
            if let Err(err) = self
                .store
                .upsert_profile(&sender_id, &sender_name, message.timestamp)
                .await
            {
                warn!("[SESSION] Failed to cache profile {}: {}", sender_id, err);
            }
        }

        if let Some(correlation_id) = message.correlation_id.as_deref() {
            if self.echoes.try_consume(correlation_id) {
                debug!("[SESSION] Suppressed echo {} in {}", correlation_id, thread.thread_id);
                return;
            }
        }

        self.emit(BridgeEvent::Message(MessageEvent {
            account_id: self.account_id.clone(),
            thread_id: thread.thread_id.clone(),
            message_id: message.id.clone(),
            sender_id,
            sender_name,
            from_self,
            timestamp: message.timestamp,
            body: html_to_text(&message.content),
            formatted_body: message.content.clone(),
            message_type: message.message_type.clone(),
            correlation_id: message.correlation_id.clone(),
            stream_order: self.order.next(message.timestamp),
        }));

        if let Err(err) = self
            .store
            .record_message(&self.account_id, &thread.thread_id, &message.id, message.timestamp)
            .await
        {
            warn!("[SESSION] Failed to index message {}: {}", message.id, err);
        }
        if !from_self {
            self.unread.mark_unread(&thread.thread_id);
        }
    }
}
