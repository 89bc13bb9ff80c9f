use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

use tether_auth::{AccessGrant, Credentials, ExchangeError, SessionGrant, TokenExchange, TokenManager};
use tether_store::{Store, ThreadRecord};

use super::*;
use crate::events::{BridgeEvent, ChannelSink, RoomType};
use crate::manager::SessionManager;
use crate::remote::{
    ConsumptionHorizon, Conversation, Member, ReactionGroup, ReactionUser, RemoteClient, RemoteError,
    RemoteMessage, RemoteResult,
};

#[derive(Default)]
struct FakeExchange {
    refresh_calls: AtomicUsize,
    session_calls: AtomicUsize,
}

#[async_trait]
impl TokenExchange for FakeExchange {
    async fn refresh_access(
        &self,
        _refresh_token: &str,
        scope: Option<&str>,
    ) -> std::result::Result<AccessGrant, ExchangeError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Ok(AccessGrant {
            access_token: match scope {
                Some(scope) => format!("access-{}", scope),
                None => "access".to_string(),
            },
            refresh_token: None,
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }

    async fn acquire_session(&self, _access_token: &str) -> std::result::Result<SessionGrant, ExchangeError> {
        let n = self.session_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionGrant {
            session_token: format!("session-{}", n),
            expires_at: Utc::now() + chrono::Duration::hours(24),
            remote_id: "live:me".to_string(),
        })
    }
}

/// Scripted remote. `list_messages` returns the whole history of a
/// conversation regardless of the cursor, which is the worst case for
/// redelivery.
#[derive(Default)]
struct FakeRemote {
    conversations: Mutex<Vec<Conversation>>,
    messages: Mutex<HashMap<String, Vec<RemoteMessage>>>,
    horizons: Mutex<HashMap<String, Vec<ConsumptionHorizon>>>,
    fail_next_poll: Mutex<Option<RemoteError>>,
    fail_next_listing: Mutex<Option<RemoteError>>,
    broken_conversations: Mutex<HashMap<String, RemoteError>>,
    fail_sends: Mutex<bool>,
    requested_cursors: Mutex<Vec<Option<String>>>,
    horizon_writes: Mutex<Vec<(String, String)>>,
    reaction_calls: Mutex<Vec<(String, String, bool)>>,
}

impl FakeRemote {
    fn push_message(&self, conversation_id: &str, message: RemoteMessage) {
        self.messages
            .lock()
            .unwrap()
            .entry(conversation_id.to_string())
            .or_default()
            .push(message);
    }

    fn set_reactions(&self, conversation_id: &str, message_id: &str, reactions: Vec<ReactionGroup>) {
        let mut messages = self.messages.lock().unwrap();
        for message in messages.get_mut(conversation_id).unwrap() {
            if message.id == message_id {
                message.reactions = reactions.clone();
            }
        }
    }

    fn set_horizons(&self, thread_id: &str, horizons: &[(&str, &str)]) {
        self.horizons.lock().unwrap().insert(
            thread_id.to_string(),
            horizons
                .iter()
                .map(|(user, blob)| ConsumptionHorizon {
                    user_id: user.to_string(),
                    horizon: blob.to_string(),
                })
                .collect(),
        );
    }

    fn echo_send(&self, thread_id: &str, body: &str, sender_id: &str, correlation_id: &str) -> RemoteResult<String> {
        if *self.fail_sends.lock().unwrap() {
            return Err(RemoteError::Server { status: 502 });
        }
        let count = self.messages.lock().unwrap().get(thread_id).map_or(0, Vec::len);
        let id = format!("{}", 900 + count);
        let mut echo = message(&id, &id, sender_id, 900 + count as i64, body);
        echo.correlation_id = Some(correlation_id.to_string());
        self.push_message(thread_id, echo);
        Ok(id)
    }
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn list_conversations(&self, _token: &str) -> RemoteResult<Vec<Conversation>> {
        if let Some(err) = self.fail_next_listing.lock().unwrap().take() {
            return Err(err);
        }
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn list_messages(
        &self,
        _token: &str,
        conversation_id: &str,
        cursor: Option<&str>,
    ) -> RemoteResult<Vec<RemoteMessage>> {
        self.requested_cursors.lock().unwrap().push(cursor.map(str::to_string));
        if let Some(err) = self.fail_next_poll.lock().unwrap().take() {
            return Err(err);
        }
        if let Some(err) = self.broken_conversations.lock().unwrap().get(conversation_id) {
            return Err(err.clone());
        }
        Ok(self
            .messages
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_reaction(
        &self,
        _token: &str,
        _thread_id: &str,
        message_id: &str,
        emotion_key: &str,
        _at: DateTime<Utc>,
    ) -> RemoteResult<()> {
        self.reaction_calls
            .lock()
            .unwrap()
            .push((message_id.to_string(), emotion_key.to_string(), true));
        Ok(())
    }

    async fn remove_reaction(
        &self,
        _token: &str,
        _thread_id: &str,
        message_id: &str,
        emotion_key: &str,
        _at: DateTime<Utc>,
    ) -> RemoteResult<()> {
        self.reaction_calls
            .lock()
            .unwrap()
            .push((message_id.to_string(), emotion_key.to_string(), false));
        Ok(())
    }

    async fn get_consumption_horizons(&self, _token: &str, thread_id: &str) -> RemoteResult<Vec<ConsumptionHorizon>> {
        Ok(self
            .horizons
            .lock()
            .unwrap()
            .get(thread_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_consumption_horizon(&self, _token: &str, thread_id: &str, horizon: &str) -> RemoteResult<()> {
        self.horizon_writes
            .lock()
            .unwrap()
            .push((thread_id.to_string(), horizon.to_string()));
        Ok(())
    }

    async fn send_message_with_id(
        &self,
        _token: &str,
        thread_id: &str,
        body: &str,
        sender_id: &str,
        correlation_id: &str,
    ) -> RemoteResult<String> {
        self.echo_send(thread_id, body, sender_id, correlation_id)
    }

    async fn send_gif_with_id(
        &self,
        _token: &str,
        thread_id: &str,
        url: &str,
        sender_id: &str,
        correlation_id: &str,
    ) -> RemoteResult<String> {
        self.echo_send(thread_id, &crate::body::gif_markup(url), sender_id, correlation_id)
    }
}

fn ts(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(1_700_000_000_000 + millis).unwrap()
}

fn message(id: &str, sequence: &str, sender: &str, at: i64, content: &str) -> RemoteMessage {
    RemoteMessage {
        id: id.to_string(),
        sequence: sequence.to_string(),
        sender_id: sender.to_string(),
        sender_name: None,
        sender_alt_name: None,
        timestamp: ts(at),
        content: content.to_string(),
        message_type: "RichText".to_string(),
        correlation_id: None,
        reactions: Vec::new(),
    }
}

fn likes(users: &[&str]) -> Vec<ReactionGroup> {
    vec![ReactionGroup {
        key: "like".to_string(),
        users: users
            .iter()
            .map(|u| ReactionUser {
                user_id: u.to_string(),
                at: None,
            })
            .collect(),
    }]
}

struct Harness {
    session: Arc<Session>,
    remote: Arc<FakeRemote>,
    exchange: Arc<FakeExchange>,
    store: Store,
    events: UnboundedReceiver<BridgeEvent>,
}

impl Harness {
    async fn new(credentials: Credentials) -> Self {
        let store = Store::in_memory().await.unwrap();
        Self::with_store(store, credentials).await
    }

    async fn with_store(store: Store, credentials: Credentials) -> Self {
        let remote = Arc::new(FakeRemote::default());
        let exchange = Arc::new(FakeExchange::default());
        let tokens = TokenManager::new(
            "acct",
            credentials,
            exchange.clone(),
            Arc::new(store.clone()),
            Duration::from_secs(60),
        );
        let (tx, events) = unbounded_channel();

        let factory_remote = remote.clone();
        let factory: ClientFactory = Arc::new(move || {
            let client: Arc<dyn RemoteClient> = factory_remote.clone();
            Ok(client)
        });

        let mut config = EngineConfig::default();
        config.receipt_interval = Duration::ZERO;
        config.file_scope = Some("files".to_string());
        let session = Arc::new(Session::new(
            Arc::new(tokens),
            store.clone(),
            Arc::new(ChannelSink::new(tx)),
            factory,
            config,
        ));
        Self {
            session,
            remote,
            exchange,
            store,
            events,
        }
    }

    async fn logged_in() -> Self {
        Self::new(Credentials::with_refresh_token("refresh")).await
    }

    async fn add_thread(&self, thread_id: &str, cursor: Option<&str>) -> ThreadRecord {
        let record = ThreadRecord {
            account_id: "acct".to_string(),
            thread_id: thread_id.to_string(),
            conversation_id: thread_id.to_string(),
            is_one_to_one: true,
            name: "Bob".to_string(),
            last_cursor: None,
            last_message_ts: None,
        };
        self.store.upsert_thread(&record).await.unwrap();
        if let Some(cursor) = cursor {
            self.store.set_thread_cursor("acct", thread_id, cursor, None).await.unwrap();
        }
        self.thread(thread_id).await
    }

    async fn thread(&self, thread_id: &str) -> ThreadRecord {
        self.store.get_thread("acct", thread_id).await.unwrap().unwrap()
    }

    fn drain(&mut self) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn message_events(events: &[BridgeEvent]) -> Vec<&crate::events::MessageEvent> {
    events
        .iter()
        .filter_map(|e| match e {
            BridgeEvent::Message(m) => Some(m),
            _ => None,
        })
        .collect()
}

fn reaction_events(events: &[BridgeEvent]) -> Vec<&crate::events::ReactionSyncEvent> {
    events
        .iter()
        .filter_map(|e| match e {
            BridgeEvent::ReactionSync(r) => Some(r),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_discovery_upserts_threads_and_emits_chat_info() {
    let mut h = Harness::logged_in().await;
    *h.remote.conversations.lock().unwrap() = vec![
        Conversation {
            id: "8:live:bob".to_string(),
            members: vec![
                Member {
                    id: "8:live:me".to_string(),
                    display_name: None,
                },
                Member {
                    id: "8:live:bob".to_string(),
                    display_name: Some("Bob".to_string()),
                },
            ],
            ..Conversation::default()
        },
        Conversation {
            id: "19:team@thread.v2".to_string(),
            topic: Some("Team".to_string()),
            ..Conversation::default()
        },
        Conversation::default(),
    ];

    // A cursor set before rediscovery survives it.
    h.add_thread("8:live:bob", Some("55")).await;

    assert_eq!(h.session.discover().await.unwrap(), 2);

    let events = h.drain();
    assert_eq!(events.len(), 2);
    match &events[0] {
        BridgeEvent::ChatInfo(info) => {
            assert_eq!(info.name, "Bob");
            assert_eq!(info.room_type, RoomType::Dm);
            assert!(info.create_if_absent);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let threads = h.store.list_threads("acct").await.unwrap();
    assert_eq!(threads.len(), 2);
    assert_eq!(h.thread("8:live:bob").await.last_cursor.as_deref(), Some("55"));
    assert!(!h.thread("19:team@thread.v2").await.is_one_to_one);
}

#[tokio::test]
async fn test_poll_emits_new_messages_once() {
    let mut h = Harness::logged_in().await;
    let thread = h.add_thread("t1", None).await;
    let mut first = message("100", "100", "8:live:bob", 100, "<b>hello</b>");
    first.sender_name = Some("Bob".to_string());
    h.remote.push_message("t1", first);
    let mut second = message("101", "101", "8:live:bob", 101, "again");
    second.sender_alt_name = Some("Bobby".to_string());
    h.remote.push_message("t1", second);
    h.remote.push_message("t1", message("", "102", "8:live:bob", 102, "no id"));

    assert_eq!(h.session.poll_thread(&thread).await.unwrap(), 2);
    let events = h.drain();
    let messages = message_events(&events);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].body, "hello");
    assert_eq!(messages[0].formatted_body, "<b>hello</b>");
    assert_eq!(messages[0].sender_name, "Bob");
    assert_eq!(messages[0].sender_id, "live:bob");
    assert!(!messages[0].from_self);
    assert!(messages[0].stream_order < messages[1].stream_order);

    let stored = h.thread("t1").await;
    assert_eq!(stored.last_cursor.as_deref(), Some("101"));
    assert_eq!(stored.last_message_ts, Some(ts(101)));
    assert_eq!(messages[1].sender_name, "Bobby");
    // The profile cache keeps the latest name seen.
    assert_eq!(h.store.get_profile("live:bob").await.unwrap().unwrap().display_name, "Bobby");

    // The remote hands back the same history: nothing is re-emitted.
    let thread = h.thread("t1").await;
    assert_eq!(h.session.poll_thread(&thread).await.unwrap(), 0);
    assert!(message_events(&h.drain()).is_empty());
    assert_eq!(h.thread("t1").await.last_cursor.as_deref(), Some("101"));

    let cursors = h.remote.requested_cursors.lock().unwrap().clone();
    assert_eq!(cursors, vec![None, Some("101".to_string())]);
}

#[tokio::test]
async fn test_cursor_never_moves_backward() {
    let mut h = Harness::logged_in().await;
    let thread = h.add_thread("t1", Some("200")).await;
    h.remote.push_message("t1", message("150", "150", "8:live:bob", 150, "old"));
    h.remote.push_message("t1", message("90", "90", "8:live:bob", 90, "older"));

    assert_eq!(h.session.poll_thread(&thread).await.unwrap(), 0);
    assert!(h.drain().is_empty());
    assert_eq!(h.thread("t1").await.last_cursor.as_deref(), Some("200"));

    // Out-of-order arrival within one batch still ends on the maximum.
    h.remote.push_message("t1", message("205", "205", "8:live:bob", 205, "b"));
    h.remote.push_message("t1", message("201", "201", "8:live:bob", 201, "a"));
    let thread = h.thread("t1").await;
    assert_eq!(h.session.poll_thread(&thread).await.unwrap(), 2);
    let events = h.drain();
    let ids: Vec<_> = message_events(&events).iter().map(|m| m.message_id.clone()).collect();
    assert_eq!(ids, vec!["201", "205"]);
    assert_eq!(h.thread("t1").await.last_cursor.as_deref(), Some("205"));
}

#[tokio::test]
async fn test_self_echo_is_suppressed_but_advances_cursor() {
    let mut h = Harness::logged_in().await;
    let thread = h.add_thread("t1", Some("10")).await;

    let sent = h.session.send_message("t1", "from home").await.unwrap();
    assert!(!sent.correlation_id.is_empty());
    assert_eq!(h.session.echoes.len(), 1);

    // Same account, different device: no correlation id, so it is bridged.
    h.remote.push_message("t1", message("950", "950", "8:live:me", 950, "from phone"));

    assert_eq!(h.session.poll_thread(&thread).await.unwrap(), 2);
    let events = h.drain();
    let messages = message_events(&events);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_id, "950");
    assert!(messages[0].from_self);
    assert!(h.session.echoes.is_empty());
    assert_eq!(h.thread("t1").await.last_cursor.as_deref(), Some("950"));

    // Own messages do not open an unread cycle.
    assert!(!h.session.unread.should_send_now("t1"));
}

#[tokio::test]
async fn test_echo_still_reconciles_reactions() {
    let mut h = Harness::logged_in().await;
    let thread = h.add_thread("t1", None).await;
    let sent = h.session.send_message("t1", "hi").await.unwrap();
    h.remote.set_reactions("t1", &sent.message_id, likes(&["8:live:bob"]));

    h.session.poll_thread(&thread).await.unwrap();
    let events = h.drain();
    assert!(message_events(&events).is_empty());
    assert_eq!(reaction_events(&events).len(), 1);
}

#[tokio::test]
async fn test_failed_send_withdraws_pending_echo() {
    let h = Harness::logged_in().await;
    h.add_thread("t1", None).await;
    *h.remote.fail_sends.lock().unwrap() = true;

    let err = h.session.send_gif("t1", "https://media.example.com/cat.gif").await.unwrap_err();
    assert!(matches!(err, SessionError::Remote(RemoteError::Server { status: 502 })));
    assert!(h.session.echoes.is_empty());
}

#[tokio::test]
async fn test_reaction_round_trip() {
    let mut h = Harness::logged_in().await;
    let thread = h.add_thread("t1", None).await;
    let mut liked = message("300", "300", "8:live:bob", 300, "nice");
    liked.reactions = likes(&["8:live:a", "8:live:b"]);
    h.remote.push_message("t1", liked);

    h.session.poll_thread(&thread).await.unwrap();
    let events = h.drain();
    let syncs = reaction_events(&events);
    assert_eq!(syncs.len(), 1);
    assert!(syncs[0].has_all_users);
    assert_eq!(syncs[0].users.len(), 2);
    for user in ["live:a", "live:b"] {
        assert_eq!(syncs[0].users[user].emojis, vec!["👍"]);
        assert!(syncs[0].users[user].has_all_reactions);
    }
    assert_eq!(h.store.reaction_count("acct", "300").await.unwrap(), 2);

    // All reactions removed remotely: exactly one empty sync.
    h.remote.set_reactions("t1", "300", Vec::new());
    for _ in 0..3 {
        let thread = h.thread("t1").await;
        h.session.poll_thread(&thread).await.unwrap();
    }
    let events = h.drain();
    let syncs = reaction_events(&events);
    assert_eq!(syncs.len(), 1);
    assert!(syncs[0].users.is_empty());
    assert_eq!(h.store.reaction_count("acct", "300").await.unwrap(), 0);
}

#[tokio::test]
async fn test_messages_without_reactions_never_sync() {
    let mut h = Harness::logged_in().await;
    let thread = h.add_thread("t1", None).await;
    h.remote.push_message("t1", message("1", "1", "8:live:bob", 1, "plain"));

    h.session.poll_thread(&thread).await.unwrap();
    assert!(reaction_events(&h.drain()).is_empty());
}

#[tokio::test]
async fn test_persisted_reaction_count_survives_restart() {
    let store = Store::in_memory().await.unwrap();
    store.set_reaction_count("acct", "400", 1).await.unwrap();
    let mut h = Harness::with_store(store, Credentials::with_refresh_token("refresh")).await;
    let thread = h.add_thread("t1", Some("400")).await;
    h.remote.push_message("t1", message("400", "400", "8:live:bob", 400, "old"));

    h.session.poll_thread(&thread).await.unwrap();
    let events = h.drain();
    let syncs = reaction_events(&events);
    assert_eq!(syncs.len(), 1);
    assert!(syncs[0].users.is_empty());
}

#[tokio::test]
async fn test_receipts_are_idempotent() {
    let mut h = Harness::logged_in().await;
    let thread = h.add_thread("t1", None).await;
    h.remote.push_message("t1", message("500", "500", "8:live:bob", 500, "read me"));
    h.session.poll_thread(&thread).await.unwrap();
    h.drain();

    let read_at = ts(600).timestamp_millis().to_string();
    let blob = format!("{};0;500", read_at);
    h.remote.set_horizons("t1", &[("8:live:me", "1;0;1"), ("8:live:bob", blob.as_str())]);

    assert!(h.session.poll_receipts(&thread).await.unwrap());
    assert!(!h.session.poll_receipts(&thread).await.unwrap());
    let events = h.drain();
    assert_eq!(events.len(), 1);
    match &events[0] {
        BridgeEvent::Receipt(receipt) => {
            assert_eq!(receipt.reader_id, "live:bob");
            assert_eq!(receipt.read_up_to, ts(600));
            assert_eq!(receipt.message_id.as_deref(), Some("500"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    let later = format!("{};0;500", ts(700).timestamp_millis());
    h.remote.set_horizons("t1", &[("8:live:bob", later.as_str())]);
    assert!(h.session.poll_receipts(&thread).await.unwrap());
    assert_eq!(h.drain().len(), 1);
    assert_eq!(
        h.store.get_receipt_cursor("acct", "t1", "live:bob").await.unwrap(),
        Some(ts(700))
    );
}

#[tokio::test]
async fn test_multi_party_horizons_are_skipped() {
    let mut h = Harness::logged_in().await;
    let thread = h.add_thread("t1", None).await;
    h.remote.set_horizons(
        "t1",
        &[("8:live:bob", "1700000000600;0;1"), ("8:live:ann", "1700000000600;0;1")],
    );

    assert!(!h.session.poll_receipts(&thread).await.unwrap());
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn test_outbound_receipt_once_per_unread_cycle() {
    let h = Harness::logged_in().await;
    let thread = h.add_thread("t1", None).await;

    assert!(!h.session.forward_read_receipt("t1", "1", ts(1)).await.unwrap());
    assert!(h.remote.horizon_writes.lock().unwrap().is_empty());

    h.remote.push_message("t1", message("10", "10", "8:live:bob", 10, "ping"));
    h.session.poll_thread(&thread).await.unwrap();

    assert!(h.session.forward_read_receipt("t1", "10", ts(10)).await.unwrap());
    assert!(!h.session.forward_read_receipt("t1", "10", ts(10)).await.unwrap());

    let writes = h.remote.horizon_writes.lock().unwrap().clone();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].0, "t1");
    assert!(writes[0].1.ends_with(";10"));
}

#[tokio::test]
async fn test_reactions_map_back_to_emotion_keys() {
    let h = Harness::logged_in().await;

    let err = h.session.send_reaction("t1", "m1", "🦀").await.unwrap_err();
    assert!(matches!(err, SessionError::UnmappedEmoji(_)));
    assert_eq!(err.outcome(), PollOutcome::ClientError);

    h.session.send_reaction("t1", "m1", "❤").await.unwrap();
    h.session.remove_reaction("t1", "m1", "❤️").await.unwrap();
    let calls = h.remote.reaction_calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![
            ("m1".to_string(), "heart".to_string(), true),
            ("m1".to_string(), "heart".to_string(), false)
        ]
    );
}

#[tokio::test]
async fn test_unauthorized_poll_forces_new_session_token() {
    let h = Harness::logged_in().await;
    let thread = h.add_thread("t1", None).await;

    h.session.poll_thread(&thread).await.unwrap();
    assert_eq!(h.exchange.session_calls.load(Ordering::SeqCst), 1);

    *h.remote.fail_next_poll.lock().unwrap() = Some(RemoteError::Unauthorized { status: 401 });
    let err = h.session.poll_thread(&thread).await.unwrap_err();
    assert!(!err.is_auth_fatal());
    assert_eq!(err.outcome(), PollOutcome::Retryable);

    h.session.poll_thread(&thread).await.unwrap();
    assert_eq!(h.exchange.session_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_remote_errors_map_to_outcomes() {
    let h = Harness::logged_in().await;
    let thread = h.add_thread("t1", None).await;

    *h.remote.fail_next_poll.lock().unwrap() = Some(RemoteError::Client {
        status: 404,
        body: "gone".to_string(),
    });
    let err = h.session.poll_thread(&thread).await.unwrap_err();
    assert_eq!(err.outcome(), PollOutcome::ClientError);

    *h.remote.fail_next_poll.lock().unwrap() = Some(RemoteError::RateLimited {
        retry_after: Some(Duration::from_secs(11)),
    });
    let err = h.session.poll_thread(&thread).await.unwrap_err();
    assert_eq!(err.outcome(), PollOutcome::RetryAfter(Duration::from_secs(11)));
}

#[tokio::test]
async fn test_run_without_credentials_reports_bad_credentials() {
    let h = Harness::new(Credentials::default()).await;
    let mut states = h.session.subscribe();

    let exit = h.session.clone().run(CancellationToken::new()).await;
    assert_eq!(exit, SessionExit::BadCredentials);
    assert_eq!(h.session.state(), SessionState::BadCredentials);
    assert_eq!(*states.borrow_and_update(), SessionState::BadCredentials);
}

#[tokio::test]
async fn test_run_loop_ingests_until_cancelled() {
    let mut h = Harness::logged_in().await;
    *h.remote.conversations.lock().unwrap() = vec![Conversation {
        id: "8:live:bob".to_string(),
        ..Conversation::default()
    }];
    h.remote.push_message("8:live:bob", message("1", "1", "8:live:bob", 1, "hi"));

    let cancel = CancellationToken::new();
    let task = tokio::spawn(h.session.clone().run(cancel.clone()));

    let mut saw_message = false;
    while !saw_message {
        let event = tokio::time::timeout(Duration::from_secs(5), h.events.recv())
            .await
            .unwrap()
            .unwrap();
        saw_message = matches!(event, BridgeEvent::Message(_));
    }
    assert_eq!(h.session.state(), SessionState::Running);

    cancel.cancel();
    let exit = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert_eq!(exit, SessionExit::Cancelled);
    assert_eq!(h.session.state(), SessionState::Stopped);
    assert_eq!(h.thread("8:live:bob").await.last_cursor.as_deref(), Some("1"));
}

#[tokio::test]
async fn test_failures_stay_local_to_their_thread() {
    let mut h = Harness::logged_in().await;
    h.add_thread("t-broken", None).await;
    h.add_thread("t-ok", None).await;
    *h.remote.fail_next_listing.lock().unwrap() = Some(RemoteError::Server { status: 503 });
    h.remote
        .broken_conversations
        .lock()
        .unwrap()
        .insert("t-broken".to_string(), RemoteError::Server { status: 503 });
    h.remote.push_message("t-broken", message("1", "1", "8:live:bob", 1, "lost"));
    h.remote.push_message("t-ok", message("2", "2", "8:live:carol", 2, "still here"));

    let mut states = h.session.subscribe();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(h.session.clone().run(cancel.clone()));

    let delivered = loop {
        let event = tokio::time::timeout(Duration::from_secs(5), h.events.recv())
            .await
            .unwrap()
            .unwrap();
        if let BridgeEvent::Message(m) = event {
            break m;
        }
    };
    assert_eq!(delivered.thread_id, "t-ok");
    assert_eq!(delivered.body, "still here");

    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == SessionState::Running))
        .await
        .unwrap()
        .unwrap();

    cancel.cancel();
    let exit = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert_eq!(exit, SessionExit::Cancelled);
    assert_eq!(h.thread("t-ok").await.last_cursor.as_deref(), Some("2"));
    assert_eq!(h.thread("t-broken").await.last_cursor, None);
    assert!(message_events(&h.drain()).iter().all(|m| m.thread_id != "t-broken"));
}

#[tokio::test]
async fn test_file_token_uses_its_own_scope() {
    let h = Harness::logged_in().await;

    assert_eq!(h.session.file_token().await.unwrap(), "access-files");
    assert_eq!(h.session.file_token().await.unwrap(), "access-files");
    assert_eq!(h.exchange.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.exchange.session_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_manager_stops_sessions() {
    let h = Harness::logged_in().await;
    let manager = SessionManager::new(CancellationToken::new(), Duration::from_secs(5));

    manager.start(h.session.clone()).await.unwrap();
    assert!(manager.start(h.session.clone()).await.is_err());
    assert_eq!(manager.states().await.len(), 1);
    assert!(manager.session("acct").await.is_some());

    assert_eq!(manager.stop("acct").await, Some(SessionExit::Cancelled));
    assert_eq!(manager.stop("acct").await, None);

    manager.start(h.session.clone()).await.unwrap();
    let exits = manager.shutdown().await;
    assert_eq!(exits, vec![("acct".to_string(), SessionExit::Cancelled)]);
}
