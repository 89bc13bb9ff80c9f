use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod shutdown;
mod ui;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Keeps a remote chat account in sync with your home network.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync session per stored account until interrupted
    Run,

    /// Store a refresh credential for an account
    Login {
        /// Local account id
        #[arg(long)]
        account: String,

        /// Refresh credential. Read from stdin when omitted.
        #[arg(long)]
        refresh_token: Option<String>,
    },

    /// Delete stored credentials for an account
    Logout {
        #[arg(long)]
        account: String,
    },

    /// Show accounts, credential freshness and known threads
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries events and command output.
    let default_level = match cli.command {
        Commands::Run => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()),
        )
        .init();

    match cli.command {
        Commands::Run => commands::run::run().await,
        Commands::Login { account, refresh_token } => commands::login::run(&account, refresh_token).await,
        Commands::Logout { account } => commands::logout::run(&account).await,
        Commands::Status { json } => commands::status::run(json).await,
    }
}
