use std::io::{BufRead, Write};

use anyhow::{bail, Result};
use tether_core::{Tether, TetherPaths};

use crate::ui;

pub async fn run(account: &str, refresh_token: Option<String>) -> Result<()> {
    let refresh_token = match refresh_token {
        Some(token) => token,
        None => read_token()?,
    };

    let tether = Tether::init(&TetherPaths::from_env()).await?;
    if let Err(err) = tether.login(account, &refresh_token).await {
        ui::error(&format!("{:#}", err));
        return Err(err);
    }

    ui::success(&format!("Stored credentials for {}", account.trim()));
    ui::info("Start syncing with: tether run");
    Ok(())
}

fn read_token() -> Result<String> {
    if console::user_attended() {
        print!("Refresh token: ");
        std::io::stdout().flush()?;
    }
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let token = line.trim().to_string();
    if token.is_empty() {
        bail!("no refresh token given");
    }
    Ok(token)
}
