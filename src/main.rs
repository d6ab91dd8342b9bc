//! notification-sync CLI - tail a user's notifications from the hub.
//!
//! This is the main binary entry point. See the `notification_sync` library
//! for the core functionality.

// Rust guideline compliant 2026-02

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use notification_sync::{
    Config, HttpHistorySource, Initialized, NotificationEngine, SignalRTransport, StaticToken,
    TokenProvider,
};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "notification-sync")]
#[command(version)]
#[command(about = "Live notification sync against a SignalR notifications hub")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, print the seeded notifications, then print each new arrival
    Watch {
        /// User whose notification group to join
        #[arg(long)]
        user_id: String,
        /// Bearer token
        #[arg(long, env = "NOTIFY_SYNC_TOKEN", hide_env_values = true)]
        token: String,
    },
    /// Print one page of notification history
    History {
        /// Page index (1-based)
        #[arg(long, default_value_t = 1)]
        page: u32,
        /// Page size
        #[arg(long, default_value_t = 10)]
        size: u32,
        /// Bearer token
        #[arg(long, env = "NOTIFY_SYNC_TOKEN", hide_env_values = true)]
        token: String,
    },
    /// Print the effective configuration
    Config,
}

fn print_notification(n: &notification_sync::Notification) {
    let marker = if n.read { ' ' } else { '*' };
    println!(
        "{marker} {} [{}] {} {} {}",
        n.created_at.format("%Y-%m-%d %H:%M:%S"),
        n.kind,
        n.id,
        n.status,
        n.payload
    );
}

async fn run_watch(config: Config, user_id: &str, token: String) -> Result<()> {
    let tokens: Arc<dyn TokenProvider> = Arc::new(StaticToken::new(token));
    let history = HttpHistorySource::new(config.api_base_url.clone())?;
    let transport = SignalRTransport::new()
        .handshake_timeout(config.handshake_timeout())
        .invoke_timeout(config.invoke_timeout());
    let engine = NotificationEngine::new(&config, Arc::new(transport), Arc::new(history));

    let mut arrivals = engine.subscribe_arrivals();
    let mut states = engine.watch_state();

    match engine
        .initialize(user_id, tokens)
        .await
        .context("failed to start notification sync")?
    {
        Initialized::Started { history: Err(e) } => {
            eprintln!("Could not load notification history: {e}");
        }
        Initialized::Started { history: Ok(count) } => {
            println!("Loaded {count} notification(s):");
            for n in engine.snapshot().iter() {
                print_notification(n);
            }
        }
        Initialized::AlreadyActive => {}
    }
    println!("Watching for notifications (Ctrl-C to stop)...");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            arrival = arrivals.recv() => match arrival {
                Ok(arrival) => print_notification(&arrival.notification),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Display fell behind, skipped {n} notification(s)");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                eprintln!("connection: {state:?}");
            }
        }
    }

    println!("Shutting down...");
    engine.teardown();
    Ok(())
}

async fn run_history(config: Config, page: u32, size: u32, token: String) -> Result<()> {
    let history = HttpHistorySource::new(config.api_base_url)?;
    let page = history.fetch(&StaticToken::new(token), page, size).await?;
    println!(
        "Page {}/{} ({} total):",
        page.current_page, page.total_pages, page.total_items
    );
    for n in &page.notifications {
        print_notification(n);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Watch { user_id, token } => run_watch(config, &user_id, token).await?,
        Commands::History { page, size, token } => run_history(config, page, size, token).await?,
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
    }

    Ok(())
}
