//! Read-receipt reconciliation in both directions.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tether_store::ThreadRecord;

use crate::events::{BridgeEvent, ReceiptEvent};
use crate::remote::{normalize_user_id, same_user};
use crate::session::{Session, SessionResult};

/// Read timestamp embedded in a `seq;time;message` horizon blob. The first
/// field is the arrival time of the last read message in milliseconds.
pub fn parse_horizon(blob: &str) -> Option<DateTime<Utc>> {
    let first = blob.split(';').next()?.trim();
    let millis: i64 = first.parse().ok()?;
    if millis <= 0 {
        return None;
    }
    DateTime::from_timestamp_millis(millis)
}

/// Horizon blob marking everything up to `read_at` as read.
pub fn horizon_value(read_at: DateTime<Utc>, message_id: &str) -> String {
    let millis = read_at.timestamp_millis();
    format!("{};{};{}", millis, millis, message_id)
}

/// Threads with inbound messages that have not been acknowledged yet.
/// Outbound receipts are sent once per unread cycle.
#[derive(Debug, Default)]
pub struct UnreadTracker {
    unread: Mutex<HashSet<String>>,
}

impl UnreadTracker {
    fn unread(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.unread.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn mark_unread(&self, thread_id: &str) {
        self.unread().insert(thread_id.to_string());
    }

    pub fn should_send_now(&self, thread_id: &str) -> bool {
        self.unread().contains(thread_id)
    }

    pub fn mark_sent(&self, thread_id: &str) {
        self.unread().remove(thread_id);
    }
}

/// Spacing of inbound read-state polls per thread.
#[derive(Debug)]
pub struct ReceiptCadence {
    interval: Duration,
    last: Mutex<HashMap<String, Instant>>,
}

impl ReceiptCadence {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// True, and records the attempt, when the thread has not been checked
    /// within the interval.
    pub fn try_begin(&self, thread_id: &str, now: Instant) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match last.get(thread_id) {
            Some(prev) if now.duration_since(*prev) < self.interval => false,
            _ => {
                last.insert(thread_id.to_string(), now);
                true
            }
        }
    }
}

impl Session {
    /// Fetch the remote read state of a thread and emit a receipt when the
    /// other participant's read position moved forward. Returns whether a
    /// receipt was emitted.
    pub async fn poll_receipts(&self, thread: &ThreadRecord) -> SessionResult<bool> {
        let token = self.token().await?;
        let client = self.client()?;
        let horizons = match client.get_consumption_horizons(&token.token, &thread.thread_id).await {
            Ok(horizons) => horizons,
            Err(err) => return Err(self.remote_failed(err).await),
        };

        let others: Vec<_> = horizons
            .iter()
            .filter(|h| !same_user(&h.user_id, &token.remote_id))
            .collect();
        let [other] = others.as_slice() else {
            debug!(
                "[SESSION] Skipping receipts for {}: {} other readers",
                thread.thread_id,
                others.len()
            );
            return Ok(false);
        };

        let reader_id = normalize_user_id(&other.user_id).to_string();
        let Some(read_at) = parse_horizon(&other.horizon) else {
            return Ok(false);
        };

        let previous = self
            .store
            .get_receipt_cursor(&self.account_id, &thread.thread_id, &reader_id)
            .await?;
        if previous.is_some_and(|prev| read_at <= prev) {
            return Ok(false);
        }

        let message_id = match self
            .store
            .message_at_or_before(&self.account_id, &thread.thread_id, read_at)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                warn!("[SESSION] Failed to resolve receipt target in {}: {}", thread.thread_id, err);
                None
            }
        };

        self.emit(BridgeEvent::Receipt(ReceiptEvent {
            account_id: self.account_id.clone(),
            thread_id: thread.thread_id.clone(),
            reader_id: reader_id.clone(),
            read_up_to: read_at,
            message_id,
        }));

        if let Err(err) = self
            .store
            .set_receipt_cursor(&self.account_id, &thread.thread_id, &reader_id, read_at)
            .await
        {
            warn!("[SESSION] Failed to persist receipt cursor for {}: {}", thread.thread_id, err);
        }
        Ok(true)
    }

    /// Forward a home-side read receipt. Only the first receipt after new
    /// inbound activity reaches the remote; returns whether it was sent.
    pub async fn forward_read_receipt(
        &self,
        thread_id: &str,
        message_id: &str,
        read_at: DateTime<Utc>,
    ) -> SessionResult<bool> {
        if !self.unread.should_send_now(thread_id) {
            debug!("[SESSION] Receipt for {} already sent this cycle", thread_id);
            return Ok(false);
        }

        let token = self.token().await?;
        let client = self.client()?;
        if let Err(err) = client
            .set_consumption_horizon(&token.token, thread_id, &horizon_value(read_at, message_id))
            .await
        {
            return Err(self.remote_failed(err).await);
        }

        self.unread.mark_sent(thread_id);
        info!("[SESSION] Marked {} read up to {}", thread_id, message_id);
        Ok(true)
    }
}
