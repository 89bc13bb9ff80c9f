use anyhow::Result;
use chrono::Utc;
use console::style;
use serde::Serialize;
use tether_core::{AccountStatus, Tether, TetherPaths};

use crate::ui;

#[derive(Serialize)]
struct Status {
    data_dir: String,
    accounts: Vec<AccountStatus>,
}

pub async fn run(json: bool) -> Result<()> {
    let paths = TetherPaths::from_env();
    let tether = Tether::init(&paths).await?;
    let accounts = tether.status().await?;

    if json {
        let status = Status {
            data_dir: paths.base_dir.display().to_string(),
            accounts,
        };
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    if accounts.is_empty() {
        println!();
        ui::error("No accounts configured.");
        println!();
        ui::info("Add one with:");
        println!("    tether login --account <id>");
        println!();
        return Ok(());
    }

    let now = Utc::now();
    for account in &accounts {
        ui::section(&account.account_id);

        let remote = if account.remote_id.is_empty() {
            style("unknown".to_string()).dim()
        } else {
            style(account.remote_id.clone())
        };
        println!("  {:<14} {}", "Remote id", remote);

        let refresh = if account.has_refresh_token {
            style("stored").green()
        } else {
            style("missing").red()
        };
        println!("  {:<14} {}", "Refresh", refresh);

        let session = match account.session_expires_at {
            Some(at) if at > now => {
                let mins = (at - now).num_minutes();
                style(format!("valid for {}m", mins)).green()
            }
            Some(_) => style("expired".to_string()).yellow(),
            None => style("none".to_string()).dim(),
        };
        println!("  {:<14} {}", "Session", session);

        println!();
        println!("  {} ({})", style("Threads").bold(), account.threads.len());
        for thread in &account.threads {
            let kind = if thread.is_one_to_one { "dm" } else { "group" };
            let last = thread
                .last_message_ts
                .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "never".to_string());
            println!(
                "  {} {:<30} {:<6} {}",
                style("●").green(),
                thread.name,
                style(kind).dim(),
                style(last).dim()
            );
        }
    }
    println!();
    Ok(())
}
