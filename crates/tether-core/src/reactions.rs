//! Reaction reconciliation.
//!
//! Every sync is a full state snapshot, never a diff. An empty snapshot is
//! only sent for messages that are known to have had reactions before.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::emoji::emoji_for_key;
use crate::events::{BridgeEvent, ReactionSyncEvent, UserReactions};
use crate::remote::{normalize_user_id, ReactionGroup, RemoteMessage};
use crate::session::{Session, SessionResult};

/// Message ids that have carried at least one reaction in this session.
#[derive(Debug, Default)]
pub struct ReactionSeen {
    seen: Mutex<HashSet<String>>,
}

impl ReactionSeen {
    fn seen(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn mark_seen(&self, message_id: &str) {
        self.seen().insert(message_id.to_string());
    }

    pub fn had_reactions(&self, message_id: &str) -> bool {
        self.seen().contains(message_id)
    }

    pub fn clear(&self, message_id: &str) {
        self.seen().remove(message_id);
    }
}

/// Per-user emoji from the remote reaction groups. Unmapped emotion keys
/// are dropped.
pub fn build_snapshot(groups: &[ReactionGroup]) -> BTreeMap<String, UserReactions> {
    let mut users: BTreeMap<String, UserReactions> = BTreeMap::new();
    for group in groups {
        let Some(emoji) = emoji_for_key(&group.key) else {
            debug!("Dropping unmapped emotion key {}", group.key);
            continue;
        };
        for user in &group.users {
            let user_id = normalize_user_id(&user.user_id);
            if user_id.is_empty() {
                continue;
            }
            let entry = users.entry(user_id.to_string()).or_insert_with(|| UserReactions {
                emojis: Vec::new(),
                has_all_reactions: true,
            });
            if !entry.emojis.iter().any(|e| e == emoji) {
                entry.emojis.push(emoji.to_string());
            }
        }
    }
    users
}

fn reaction_total(snapshot: &BTreeMap<String, UserReactions>) -> usize {
    snapshot.values().map(|u| u.emojis.len()).sum()
}

impl Session {
    /// Sync the reaction state of one message. Returns whether an event was
    /// emitted.
    pub(crate) async fn reconcile_reactions(&self, thread_id: &str, message: &RemoteMessage) -> SessionResult<bool> {
        let snapshot = build_snapshot(&message.reactions);

        if !snapshot.is_empty() {
            let total = reaction_total(&snapshot);
            self.reactions_seen.mark_seen(&message.id);
            self.emit_reaction_sync(thread_id, &message.id, snapshot);
            if let Err(err) = self.store.set_reaction_count(&self.account_id, &message.id, total).await {
                warn!("[SESSION] Failed to persist reaction count for {}: {}", message.id, err);
            }
            return Ok(true);
        }

        let had_reactions = self.reactions_seen.had_reactions(&message.id)
            || match self.store.reaction_count(&self.account_id, &message.id).await {
                Ok(count) => count > 0,
                Err(err) => {
                    warn!("[SESSION] Failed to read reaction count for {}: {}", message.id, err);
                    false
                }
            };
        if !had_reactions {
            return Ok(false);
        }

        debug!("[SESSION] Reactions cleared on {}", message.id);
        self.emit_reaction_sync(thread_id, &message.id, BTreeMap::new());
        self.reactions_seen.clear(&message.id);
        if let Err(err) = self.store.set_reaction_count(&self.account_id, &message.id, 0).await {
            warn!("[SESSION] Failed to persist reaction count for {}: {}", message.id, err);
        }
        Ok(true)
    }

    fn emit_reaction_sync(&self, thread_id: &str, message_id: &str, users: BTreeMap<String, UserReactions>) {
        self.emit(BridgeEvent::ReactionSync(ReactionSyncEvent {
            account_id: self.account_id.clone(),
            thread_id: thread_id.to_string(),
            message_id: message_id.to_string(),
            users,
            has_all_users: true,
        }));
    }
}
