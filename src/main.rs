//! skirmish - battle daemon
//!
//! Reads `[#thread] <user> <verb> [args...]` lines from stdin and logs every
//! reply.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skirmish::characters::MemoryCharacterStore;
use skirmish::commands::parse_line;
use skirmish::config::Config;
use skirmish::notify::TracingNotifier;
use skirmish::App;

#[derive(Parser, Debug)]
#[command(name = "skirmish")]
#[command(about = "Turn-based battle engine for chat-driven RPG sessions")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON file with an array of character records
    #[arg(long)]
    characters: Option<PathBuf>,

    /// Thread used for lines without a #thread prefix
    #[arg(long, default_value = "main")]
    thread: String,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let (plain, json) = if args.json {
        (None, Some(tracing_subscriber::fmt::layer().json()))
    } else {
        (Some(tracing_subscriber::fmt::layer()), None)
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skirmish=info".into()),
        )
        .with(plain)
        .with(json)
        .init();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    let store = MemoryCharacterStore::shared();
    if let Some(ref path) = args.characters {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let count = store.load_json(&json).await?;
        info!("Loaded {} characters from {}", count, path.display());
    }

    let app = App::new(config, store, Arc::new(TracingNotifier));
    let timer = app.start_timer();
    let handler = app.handler();
    info!("skirmish ready, reading commands from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_line(&line, &args.thread) {
                    Ok(inbound) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            let _ = handler.handle_inbound(inbound).await;
                        });
                    }
                    Err(e) => warn!("Ignoring line {:?}: {}", line, e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    timer.shutdown().await;
    info!("skirmish shutdown complete");
    Ok(())
}
