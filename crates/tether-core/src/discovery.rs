//! Thread discovery: list remote conversations and keep thread records and
//! home-side room metadata current.

use tracing::{debug, info, warn};

use tether_store::ThreadRecord;

use crate::events::{BridgeEvent, ChatInfoEvent, RoomType};
use crate::remote::{normalize_user_id, same_user, Conversation, Member};
use crate::session::{Session, SessionResult};

const MAX_NAMES_IN_GROUP_TITLE: usize = 3;

/// Turn a listed conversation into a thread record with a derived
/// one-to-one flag and display name. The cursor is left empty; upserts never
/// overwrite it.
pub fn normalize_conversation(account_id: &str, conversation: &Conversation, self_id: &str) -> ThreadRecord {
    let others: Vec<_> = conversation
        .members
        .iter()
        .filter(|m| !same_user(&m.id, self_id))
        .collect();

    let is_one_to_one = conversation
        .one_to_one_hint
        .unwrap_or_else(|| conversation.id.starts_with("8:") || (others.len() == 1 && conversation.topic.is_none()));

    let member_name = |m: &&Member| {
        m.display_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| normalize_user_id(&m.id).to_string())
    };

    let topic = conversation.topic.as_deref().map(str::trim).filter(|t| !t.is_empty());
    let name = match topic {
        Some(topic) => topic.to_string(),
        None if is_one_to_one => others
            .first()
            .map(member_name)
            .unwrap_or_else(|| normalize_user_id(&conversation.id).to_string()),
        None if !others.is_empty() => others
            .iter()
            .take(MAX_NAMES_IN_GROUP_TITLE)
            .map(member_name)
            .collect::<Vec<_>>()
            .join(", "),
        None => conversation.id.clone(),
    };

    ThreadRecord {
        account_id: account_id.to_string(),
        thread_id: conversation.id.clone(),
        conversation_id: conversation
            .conversation_id
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| conversation.id.clone()),
        is_one_to_one,
        name,
        last_cursor: None,
        last_message_ts: None,
    }
}

impl Session {
    /// List all conversations, upsert their thread records and emit a
    /// metadata refresh for each. Returns the number of threads seen.
    pub async fn discover(&self) -> SessionResult<usize> {
        let token = self.token().await?;
        let client = self.client()?;
        let conversations = match client.list_conversations(&token.token).await {
            Ok(conversations) => conversations,
            Err(err) => return Err(self.remote_failed(err).await),
        };

        let mut count = 0;
        for conversation in &conversations {
            if conversation.id.trim().is_empty() {
                continue;
            }
            let record = normalize_conversation(&self.account_id, conversation, &token.remote_id);
            if let Err(err) = self.store.upsert_thread(&record).await {
                warn!("[DISCOVERY] Failed to store thread {}: {}", record.thread_id, err);
                continue;
            }
            debug!("[DISCOVERY] {} -> {:?}", record.thread_id, record.name);

            self.emit(BridgeEvent::ChatInfo(ChatInfoEvent {
                account_id: self.account_id.clone(),
                thread_id: record.thread_id,
                name: record.name,
                room_type: if record.is_one_to_one { RoomType::Dm } else { RoomType::Group },
                create_if_absent: true,
            }));
            count += 1;
        }

        info!("[DISCOVERY] {} has {} threads", self.account_id, count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, name: Option<&str>) -> Member {
        Member {
            id: id.to_string(),
            display_name: name.map(str::to_string),
        }
    }

    #[test]
    fn test_one_to_one_named_after_other_member() {
        let conv = Conversation {
            id: "8:live:bob".to_string(),
            members: vec![member("8:live:me", Some("Me")), member("8:live:bob", Some("Bob"))],
            ..Conversation::default()
        };
        let record = normalize_conversation("acct", &conv, "live:me");
        assert!(record.is_one_to_one);
        assert_eq!(record.name, "Bob");
        assert_eq!(record.conversation_id, "8:live:bob");
        assert!(record.last_cursor.is_none());
    }

    #[test]
    fn test_group_names() {
        let mut conv = Conversation {
            id: "19:abc@thread.v2".to_string(),
            conversation_id: Some("19:abc@thread.v2;messageid=7".to_string()),
            members: vec![
                member("8:live:me", None),
                member("8:live:a", Some("Ann")),
                member("8:live:b", None),
            ],
            ..Conversation::default()
        };
        let record = normalize_conversation("acct", &conv, "live:me");
        assert!(!record.is_one_to_one);
        assert_eq!(record.name, "Ann, live:b");
        assert_eq!(record.conversation_id, "19:abc@thread.v2;messageid=7");

        conv.topic = Some("  Weekend plans ".to_string());
        assert_eq!(normalize_conversation("acct", &conv, "live:me").name, "Weekend plans");
    }

    #[test]
    fn test_hint_overrides_heuristics() {
        let conv = Conversation {
            id: "19:pair@thread.v2".to_string(),
            members: vec![member("8:live:a", None)],
            one_to_one_hint: Some(false),
            ..Conversation::default()
        };
        let record = normalize_conversation("acct", &conv, "live:me");
        assert!(!record.is_one_to_one);
        assert_eq!(record.name, "live:a");
    }
}
