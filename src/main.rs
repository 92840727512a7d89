//! Perpetuals Copy-Trading Engine
//!
//! Mirrors a leader's live position changes on OKX or Hyperliquid into
//! follower accounts, proportionally to account size. Only positions the
//! leader opens after tracking starts are ever copied.

mod api;
mod db;
mod models;
mod trading;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{HyperliquidClient, HyperliquidStream, LeaderDataSource, OkxClient, OkxCredentials};
use crate::db::{Database, MemoryStore, PositionMappingStore};
use crate::models::Venue;
use crate::trading::{
    AppConfig, CopyConfig, DecisionDispatcher, DecisionExecutor, DryRunExecutor, EngineConfig, EngineManager,
    FeedKind, LeaderFeed, SignalEngine,
};

/// Perpetuals copy-trading CLI.
#[derive(Parser)]
#[command(name = "perpcopier")]
#[command(about = "Mirror a leader's perpetual positions into follower accounts", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./perpcopier.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an engine for every configured follower
    Run {
        /// JSON config file
        #[arg(short, long)]
        config: PathBuf,

        /// Follower equity reported by the dry-run executor, in USD
        #[arg(short, long, default_value = "1000")]
        equity: Decimal,

        /// Follower available balance, in USD (defaults to equity)
        #[arg(short, long)]
        available: Option<Decimal>,

        /// Keep mappings in memory instead of the database
        #[arg(long)]
        in_memory: bool,
    },

    /// Validate and show a config file with defaults filled in
    Config {
        /// JSON config file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// List stored position mappings of a follower
    Mappings {
        /// Follower account id
        #[arg(short, long)]
        follower: String,
    },

    /// Fetch a leader's current account snapshot
    Snapshot {
        /// Venue (okx, hyperliquid)
        #[arg(short, long)]
        venue: String,

        /// Leader wallet address or account label
        #[arg(short = 'L', long)]
        leader: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            config,
            equity,
            available,
            in_memory,
        } => {
            let app = AppConfig::load(&config)?;
            if app.followers.is_empty() {
                println!("No followers configured in {}.", config.display());
                return Ok(());
            }

            let store: Arc<dyn PositionMappingStore> = if in_memory {
                Arc::new(MemoryStore::new())
            } else {
                Arc::new(Database::new(&cli.database).await?)
            };
            let mut executor = DryRunExecutor::new(equity);
            if let Some(available) = available {
                executor = executor.with_available(available);
            }

            run(app, store, Arc::new(executor)).await?;
        }

        Commands::Config { config } => {
            let app = AppConfig::load(&config)?;

            println!("\n=== Engine Configuration ===\n");
            println!("{}", serde_json::to_string_pretty(&app.engine)?);

            println!("\n=== Followers ({}) ===\n", app.followers.len());
            println!(
                "{:<16} {:<12} {:<10} {:<44} {:>6} {:>8}",
                "FOLLOWER", "VENUE", "FEED", "LEADER", "RATIO", "MIN"
            );
            println!("{}", "-".repeat(101));
            for follower in &app.followers {
                println!(
                    "{:<16} {:<12} {:<10} {:<44} {:>6} {:>8}",
                    truncate(&follower.follower_id, 16),
                    follower.venue,
                    format!("{:?}", follower.feed).to_lowercase(),
                    truncate(&follower.leader_id, 44),
                    follower.copy_ratio,
                    follower.min_copy_size
                );
            }
        }

        Commands::Mappings { follower } => {
            let db = Database::new(&cli.database).await?;
            let mappings = db.list_mappings(&follower).await?;

            if mappings.is_empty() {
                println!("No mappings stored for {}.", follower);
                return Ok(());
            }

            println!(
                "\n{:>6} {:<32} {:<12} {:<6} {:<8} {:>14} {:>5} {:>5}",
                "ID", "LEADER POSITION", "SYMBOL", "SIDE", "STATUS", "LAST SIZE", "ADDS", "REDS"
            );
            println!("{}", "-".repeat(95));
            for m in mappings {
                println!(
                    "{:>6} {:<32} {:<12} {:<6} {:<8} {:>14} {:>5} {:>5}",
                    m.id,
                    truncate(&m.leader_position.to_string(), 32),
                    m.symbol,
                    m.side,
                    m.status,
                    m.last_known_size,
                    m.add_count,
                    m.reduce_count
                );
            }

            let executed = db.count_executions(&follower, "executed").await?;
            let failed = db.count_executions(&follower, "failed").await?;
            println!("\nExecutions: {} executed, {} failed", executed, failed);
        }

        Commands::Snapshot { venue, leader } => {
            let venue = Venue::parse(&venue).with_context(|| format!("Unknown venue {:?}", venue))?;
            let source = polling_source(venue)?;
            let state = source.get_account_state(&leader).await?;

            println!("\n=== {} leader {} ===", venue, leader);
            println!("Total equity:      ${}", state.total_equity);
            println!("Available balance: ${}", state.available_balance);

            println!("\n--- Open Positions ({}) ---", state.positions.len());
            let mut positions: Vec<_> = state.positions.values().collect();
            positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
            for pos in positions {
                println!(
                    "  {} {} {} @ {} ({}x {}, id {})",
                    pos.symbol,
                    pos.side,
                    pos.size,
                    pos.entry_price,
                    pos.leverage,
                    pos.margin_mode,
                    pos.key()
                );
            }
        }
    }

    Ok(())
}

/// Start every follower, then block until Ctrl+C.
async fn run(app: AppConfig, store: Arc<dyn PositionMappingStore>, dry_run: Arc<DryRunExecutor>) -> Result<()> {
    let executor: Arc<dyn DecisionExecutor> = dry_run.clone();
    let positions = executor
        .get_positions()
        .await
        .context("Failed to read follower positions")?;
    info!(positions = positions.len(), "Follower account loaded");

    let manager = EngineManager::new();
    let mut dispatchers = Vec::new();

    for follower in &app.followers {
        let feed = match leader_feed(follower, &app.engine) {
            Ok(feed) => feed,
            Err(e) => {
                error!(follower = %follower.follower_id, error = %format!("{:#}", e), "Failed to build leader feed");
                continue;
            }
        };

        let (engine, decisions) = SignalEngine::new(
            follower.clone(),
            app.engine.clone(),
            feed,
            store.clone(),
            executor.clone(),
        );

        let dispatcher = DecisionDispatcher::new(executor.clone(), store.clone());
        dispatchers.push(tokio::spawn(dispatcher.run(decisions, manager.shutdown_token())));

        if let Err(e) = manager.start_engine(Arc::new(engine)).await {
            error!(follower = %follower.follower_id, error = %e, "Failed to start engine");
        }
    }

    let running = manager.running_count().await;
    println!("\n=== Perpetuals Copy-Trading Engine ===");
    println!("Followers configured: {}", app.followers.len());
    println!("Engines running:      {}", running);
    println!("Mode: DRY RUN (decisions are logged, not executed)");
    println!("\nPress Ctrl+C to stop.\n");

    if running == 0 {
        warn!("No engine started, exiting");
        manager.shutdown().await;
        return Ok(());
    }

    let mut health = tokio::time::interval(app.engine.state_refresh_interval());
    health.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = health.tick() => restart_stopped(&manager).await,
        }
    }

    manager.shutdown().await;
    for handle in dispatchers {
        let _ = handle.await;
    }

    info!(executed = dry_run.executed_count(), "Shutdown complete");
    Ok(())
}

/// Restart engines whose worker ended on its own (e.g. a closed stream).
async fn restart_stopped(manager: &EngineManager) {
    for follower_id in manager.list().await {
        let Some(engine) = manager.get(&follower_id).await else {
            continue;
        };
        if engine.is_running() {
            continue;
        }

        warn!(follower = %follower_id, "Engine not running, restarting");
        if let Err(e) = manager.restart_engine(&follower_id).await {
            error!(follower = %follower_id, error = %e, "Engine restart failed");
        }
    }
}

fn leader_feed(follower: &CopyConfig, engine: &EngineConfig) -> Result<LeaderFeed> {
    Ok(match follower.feed {
        FeedKind::Polling => LeaderFeed::Polling(polling_source(follower.venue)?),
        FeedKind::Streaming => {
            anyhow::ensure!(
                follower.venue == Venue::Hyperliquid,
                "streaming is only available for hyperliquid"
            );
            let stream = HyperliquidStream::new(
                HyperliquidClient::new()?,
                engine.reconnect_delay(),
                engine.keepalive_interval(),
            );
            LeaderFeed::Streaming(Arc::new(stream))
        }
    })
}

fn polling_source(venue: Venue) -> Result<Arc<dyn LeaderDataSource>> {
    Ok(match venue {
        Venue::Okx => {
            let credentials = OkxCredentials::from_env().context("OKX credentials missing")?;
            Arc::new(OkxClient::new(credentials)?)
        }
        Venue::Hyperliquid => Arc::new(HyperliquidClient::new()?),
    })
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
