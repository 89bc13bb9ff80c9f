//! Runs one session task per account.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::session::{Session, SessionExit, SessionState};

struct RunningSession {
    session: Arc<Session>,
    cancel: CancellationToken,
    handle: JoinHandle<SessionExit>,
}

pub struct SessionManager {
    root: CancellationToken,
    grace: Duration,
    sessions: Mutex<HashMap<String, RunningSession>>,
}

impl SessionManager {
    /// Sessions get child tokens of `root`, so cancelling it stops all of them.
    pub fn new(root: CancellationToken, grace: Duration) -> Self {
        Self {
            root,
            grace,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn start(&self, session: Arc<Session>) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let account_id = session.account_id().to_string();
        if let Some(existing) = sessions.get(&account_id) {
            if !existing.handle.is_finished() {
                bail!("session for {} is already running", account_id);
            }
        }

        let cancel = self.root.child_token();
        let handle = tokio::spawn(session.clone().run(cancel.clone()));
        info!("[SESSION] Started task for {}", account_id);
        sessions.insert(
            account_id,
            RunningSession {
                session,
                cancel,
                handle,
            },
        );
        Ok(())
    }

    pub async fn session(&self, account_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .await
            .get(account_id)
            .map(|running| running.session.clone())
    }

    pub async fn states(&self) -> Vec<(String, SessionState)> {
        let sessions = self.sessions.lock().await;
        let mut states: Vec<_> = sessions
            .iter()
            .map(|(account, running)| (account.clone(), running.session.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Stop one session. Returns `None` if it was not running.
    pub async fn stop(&self, account_id: &str) -> Option<SessionExit> {
        let running = self.sessions.lock().await.remove(account_id)?;
        running.cancel.cancel();
        Some(self.wait(account_id, running.handle).await)
    }

    /// Cancel every session and wait for each within the grace period.
    pub async fn shutdown(&self) -> Vec<(String, SessionExit)> {
        self.root.cancel();
        let drained: Vec<_> = self.sessions.lock().await.drain().collect();

        let mut exits = Vec::with_capacity(drained.len());
        for (account_id, running) in drained {
            let exit = self.wait(&account_id, running.handle).await;
            exits.push((account_id, exit));
        }
        exits
    }

    /// Wait until every running session task has finished on its own.
    pub async fn wait_all(&self) {
        loop {
            let pending = {
                let sessions = self.sessions.lock().await;
                sessions.values().any(|running| !running.handle.is_finished())
            };
            if !pending || self.root.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = self.root.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }

    async fn wait(&self, account_id: &str, mut handle: JoinHandle<SessionExit>) -> SessionExit {
        match tokio::time::timeout(self.grace, &mut handle).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(err)) => {
                warn!("[SESSION] Task for {} failed: {}", account_id, err);
                SessionExit::Aborted
            }
            Err(_) => {
                warn!(
                    "[SESSION] Task for {} did not stop within {:?}, aborting",
                    account_id, self.grace
                );
                handle.abort();
                SessionExit::Aborted
            }
        }
    }
}
