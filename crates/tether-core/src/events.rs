//! Events handed to the home side, and the sinks that carry them.
//!
//! Emission is fire-and-forget: a sink never reports failure back to the
//! engine.

use std::collections::BTreeMap;
use std::io::Write;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomType {
    Dm,
    Group,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatInfoEvent {
    pub account_id: String,
    pub thread_id: String,
    pub name: String,
    pub room_type: RoomType,
    /// The home side creates the room if it does not exist yet.
    pub create_if_absent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub account_id: String,
    pub thread_id: String,
    pub message_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub from_self: bool,
    pub timestamp: DateTime<Utc>,
    /// Plain-text rendition of `formatted_body`.
    pub body: String,
    pub formatted_body: String,
    pub message_type: String,
    pub correlation_id: Option<String>,
    /// Strictly increasing per session; derived from the timestamp.
    pub stream_order: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserReactions {
    pub emojis: Vec<String>,
    pub has_all_reactions: bool,
}

/// Full reaction state of one message. Replaces whatever the home side had.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionSyncEvent {
    pub account_id: String,
    pub thread_id: String,
    pub message_id: String,
    pub users: BTreeMap<String, UserReactions>,
    pub has_all_users: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptEvent {
    pub account_id: String,
    pub thread_id: String,
    pub reader_id: String,
    pub read_up_to: DateTime<Utc>,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    ChatInfo(ChatInfoEvent),
    Message(MessageEvent),
    ReactionSync(ReactionSyncEvent),
    Receipt(ReceiptEvent),
}

impl BridgeEvent {
    pub fn thread_id(&self) -> &str {
        match self {
            BridgeEvent::ChatInfo(e) => &e.thread_id,
            BridgeEvent::Message(e) => &e.thread_id,
            BridgeEvent::ReactionSync(e) => &e.thread_id,
            BridgeEvent::Receipt(e) => &e.thread_id,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: BridgeEvent);
}

/// Prints `TETHER_EVENT:{json}` lines on stdout for a supervising process.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLineSink;

pub const EVENT_LINE_PREFIX: &str = "TETHER_EVENT:";

impl JsonLineSink {
    pub fn render(event: &BridgeEvent) -> Option<String> {
        serde_json::to_string(event)
            .ok()
            .map(|json| format!("{}{}", EVENT_LINE_PREFIX, json))
    }
}

impl EventSink for JsonLineSink {
    fn emit(&self, event: BridgeEvent) {
        let Some(line) = Self::render(&event) else {
            warn!("[SESSION] Dropping unserializable event for {}", event.thread_id());
            return;
        };
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{}", line);
        let _ = stdout.flush();
    }
}

/// Forwards events into an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<BridgeEvent>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<BridgeEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: BridgeEvent) {
        // A closed receiver means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}
