use std::sync::Arc;

use anyhow::Result;
use tether_core::{EventSink, JsonLineSink, SessionExit, SessionManager, Tether, TetherPaths};
use tracing::{error, info, warn};

use crate::shutdown::install_signal_handler;

pub async fn run() -> Result<()> {
    let paths = TetherPaths::from_env();
    let tether = Tether::init(&paths).await?;

    let accounts = tether.accounts().await?;
    if accounts.is_empty() {
        warn!("No accounts configured. Add one with `tether login --account <id>`");
        return Ok(());
    }

    let cancel = install_signal_handler();
    let manager = SessionManager::new(cancel.clone(), tether.config.engine().shutdown_grace);
    let sink: Arc<dyn EventSink> = Arc::new(JsonLineSink);

    let mut started = 0;
    for account_id in &accounts {
        match tether.build_session(account_id, sink.clone()).await {
            Ok(session) => {
                manager.start(session).await?;
                started += 1;
            }
            Err(err) => error!("[SESSION] Could not start {}: {:#}", account_id, err),
        }
    }
    if started == 0 {
        anyhow::bail!("no session could be started");
    }
    info!("[SESSION] Running {} of {} accounts", started, accounts.len());

    manager.wait_all().await;

    for (account_id, exit) in manager.shutdown().await {
        match exit {
            SessionExit::Cancelled => info!("[SESSION] {} stopped", account_id),
            SessionExit::BadCredentials => {
                warn!("[SESSION] {} needs a new login: `tether login --account {}`", account_id, account_id)
            }
            SessionExit::Aborted => warn!("[SESSION] {} did not stop cleanly", account_id),
        }
    }
    Ok(())
}
