use anyhow::Result;
use tether_core::{Tether, TetherPaths};

use crate::ui;

pub async fn run(account: &str) -> Result<()> {
    let tether = Tether::init(&TetherPaths::from_env()).await?;
    if tether.logout(account).await? {
        ui::success(&format!("Removed credentials for {}", account));
    } else {
        ui::info(&format!("No credentials stored for {}", account));
    }
    Ok(())
}
