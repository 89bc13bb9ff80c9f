//! One logged-in account's synchronization loop.
//!
//! A [`Session`] owns everything the engine keeps per account. The
//! component logic lives in sibling modules as `impl Session` blocks:
//! discovery, ingestion, reactions, receipts and outbound operations.

#[cfg(test)]
mod tests;

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tether_auth::{AuthError, ExchangeError, SessionToken, TokenManager};
use tether_store::{Store, ThreadRecord};

use crate::backoff::PollOutcome;
use crate::config::EngineConfig;
use crate::echo::PendingEchoes;
use crate::events::{BridgeEvent, EventSink};
use crate::ingest::{CursorCache, StreamOrder};
use crate::reactions::ReactionSeen;
use crate::receipts::{ReceiptCadence, UnreadTracker};
use crate::remote::{RemoteClient, RemoteError};
use crate::scheduler::PollScheduler;

/// Creates the remote client on first use.
pub type ClientFactory = Arc<dyn Fn() -> anyhow::Result<Arc<dyn RemoteClient>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    /// Credentials are gone or rejected; the user has to log in again.
    BadCredentials,
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::BadCredentials => "bad_credentials",
            SessionState::Stopped => "stopped",
        }
    }
}

/// Why the session loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    Cancelled,
    BadCredentials,
    /// The task did not stop within the grace period or panicked.
    Aborted,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("no remote emotion for emoji {0:?}")]
    UnmappedEmoji(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SessionError {
    pub fn is_auth_fatal(&self) -> bool {
        matches!(self, SessionError::Auth(err) if err.is_fatal())
    }

    pub fn outcome(&self) -> PollOutcome {
        match self {
            SessionError::Remote(err) => err.outcome(),
            SessionError::Auth(AuthError::Exchange(ExchangeError::RateLimited {
                retry_after: Some(wait),
            })) => PollOutcome::RetryAfter(*wait),
            SessionError::Auth(_) | SessionError::Other(_) => PollOutcome::Retryable,
            SessionError::UnmappedEmoji(_) => PollOutcome::ClientError,
        }
    }
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

pub struct Session {
    pub(crate) account_id: String,
    pub(crate) tokens: Arc<TokenManager>,
    pub(crate) store: Store,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) config: EngineConfig,
    client_factory: ClientFactory,
    client: Mutex<Option<Arc<dyn RemoteClient>>>,
    pub(crate) echoes: PendingEchoes,
    pub(crate) reactions_seen: ReactionSeen,
    pub(crate) unread: UnreadTracker,
    pub(crate) receipt_cadence: ReceiptCadence,
    pub(crate) cursors: CursorCache,
    pub(crate) order: StreamOrder,
    state: watch::Sender<SessionState>,
}

impl Session {
    pub fn new(
        tokens: Arc<TokenManager>,
        store: Store,
        sink: Arc<dyn EventSink>,
        client_factory: ClientFactory,
        config: EngineConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        Self {
            account_id: tokens.account_id().to_string(),
            echoes: PendingEchoes::new(config.echo_ttl),
            receipt_cadence: ReceiptCadence::new(config.receipt_interval),
            tokens,
            store,
            sink,
            config,
            client_factory,
            client: Mutex::new(None),
            reactions_seen: ReactionSeen::default(),
            unread: UnreadTracker::default(),
            cursors: CursorCache::default(),
            order: StreamOrder::default(),
            state,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!(
                "[SESSION] {} {} -> {}",
                self.account_id,
                current.as_str(),
                next.as_str()
            );
            *current = next;
            true
        });
    }

    /// The remote client, created lazily and shared by all callers.
    pub(crate) fn client(&self) -> SessionResult<Arc<dyn RemoteClient>> {
        let mut slot = self.client.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client = (self.client_factory)()?;
        *slot = Some(client.clone());
        Ok(client)
    }

    pub(crate) async fn token(&self) -> SessionResult<SessionToken> {
        Ok(self.tokens.ensure_session_token().await?)
    }

    /// Classify a failed remote call. A rejected session token is dropped so
    /// the next call re-exchanges it.
    pub(crate) async fn remote_failed(&self, err: RemoteError) -> SessionError {
        if err.is_unauthorized() {
            warn!("[SESSION] {} session token rejected, re-exchanging on next call", self.account_id);
            self.tokens.invalidate_session().await;
        }
        SessionError::Remote(err)
    }

    pub(crate) fn emit(&self, event: BridgeEvent) {
        self.sink.emit(event);
    }

    /// Drive discovery and per-thread polling until `cancel` fires or the
    /// credentials turn out to be unusable.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> SessionExit {
        self.set_state(SessionState::Starting);
        info!("[SESSION] Starting session for {}", self.account_id);

        let mut scheduler = PollScheduler::new(self.config.scheduler.clone());
        let exit = loop {
            if cancel.is_cancelled() {
                break SessionExit::Cancelled;
            }

            let now = Instant::now();
            if scheduler.discovery_due(now) {
                scheduler.mark_discovery(now);
                match self.discover().await {
                    Ok(count) => {
                        debug!("[DISCOVERY] {} refreshed {} threads", self.account_id, count);
                        let stats = scheduler.stats(now);
                        debug!(
                            "[SCHEDULER] {} tracking {} threads, {} failing, {} due",
                            self.account_id, stats.threads, stats.failing, stats.due_now
                        );
                        self.set_state(SessionState::Running);
                    }
                    Err(err) if err.is_auth_fatal() => {
                        error!("[DISCOVERY] {} credentials unusable: {}", self.account_id, err);
                        break SessionExit::BadCredentials;
                    }
                    Err(err) => warn!("[DISCOVERY] {} discovery failed: {}", self.account_id, err),
                }
            }

            let threads = match self.store.list_threads(&self.account_id).await {
                Ok(threads) => threads,
                Err(err) => {
                    warn!("[SCHEDULER] {} failed to list threads: {}", self.account_id, err);
                    Vec::new()
                }
            };
            scheduler.track_threads(threads.iter().map(|t| t.thread_id.as_str()), now);

            if let Some(exit) = self.poll_due_threads(&threads, &mut scheduler, &cancel).await {
                break exit;
            }
            // Polling goes on even while discovery keeps failing.
            self.set_state(SessionState::Running);

            let wake = scheduler.next_wakeup(Instant::now());
            tokio::select! {
                _ = cancel.cancelled() => break SessionExit::Cancelled,
                _ = tokio::time::sleep_until(wake) => {}
            }
        };

        match exit {
            SessionExit::BadCredentials => self.set_state(SessionState::BadCredentials),
            _ => self.set_state(SessionState::Stopped),
        }
        info!("[SESSION] Session for {} exited: {:?}", self.account_id, exit);
        exit
    }

    /// Poll every due thread once. Returns an exit only when the session
    /// must stop.
    async fn poll_due_threads(
        &self,
        threads: &[ThreadRecord],
        scheduler: &mut PollScheduler,
        cancel: &CancellationToken,
    ) -> Option<SessionExit> {
        for thread in threads {
            if cancel.is_cancelled() {
                return Some(SessionExit::Cancelled);
            }
            if !scheduler.is_due(&thread.thread_id, Instant::now()) {
                continue;
            }

            let outcome = match self.poll_thread(thread).await {
                Ok(count) => PollOutcome::from_count(count),
                Err(err) if err.is_auth_fatal() => {
                    error!("[SCHEDULER] {} credentials unusable: {}", self.account_id, err);
                    return Some(SessionExit::BadCredentials);
                }
                Err(err) => {
                    warn!("[SCHEDULER] Poll of {} failed: {}", thread.thread_id, err);
                    err.outcome()
                }
            };
            let (delay, reason) = scheduler.record(&thread.thread_id, outcome, Instant::now());
            debug!(
                "[SCHEDULER] {} next poll in {:?} ({})",
                thread.thread_id,
                delay,
                reason.as_str()
            );

            if self.receipt_cadence.try_begin(&thread.thread_id, Instant::now()) {
                match self.poll_receipts(thread).await {
                    Ok(_) => {}
                    Err(err) if err.is_auth_fatal() => {
                        error!("[SCHEDULER] {} credentials unusable: {}", self.account_id, err);
                        return Some(SessionExit::BadCredentials);
                    }
                    Err(err) => debug!("[SCHEDULER] Receipt poll of {} failed: {}", thread.thread_id, err),
                }
            }
        }
        None
    }
}
