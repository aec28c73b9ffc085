mod api;
mod catalog;
mod client;
mod collector;
mod config;
mod db;
mod detector;
mod error;
mod notifier;
mod payload;
mod scheduler;
mod types;

use std::sync::Arc;
use std::time::Instant;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::{router, ApiState};
use crate::client::{UpstreamClient, Venue};
use crate::collector::TickCollector;
use crate::config::Config;
use crate::db::Store;
use crate::detector::AnomalyDetector;
use crate::error::Result;
use crate::notifier::{LogNotifier, Notifier, TelegramNotifier};
use crate::scheduler::{CatalogRefresher, Heartbeat, TickPoller};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    let started = Instant::now();
    let cfg = Arc::new(cfg);

    // --- Database setup ---
    let options = SqliteConnectOptions::new()
        .filename(&cfg.db_path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    let store = Store::new(pool);
    info!("Database ready at {}", cfg.db_path);

    // --- Wiring ---
    let venue: Arc<dyn Venue> = Arc::new(UpstreamClient::new(&cfg)?);

    let notifier: Arc<dyn Notifier> =
        match (cfg.telegram_bot_token.clone(), cfg.telegram_chat_id.clone()) {
            (Some(token), Some(chat_id)) => {
                info!("Telegram notifier configured (chat {chat_id})");
                Arc::new(TelegramNotifier::new(token, chat_id)?)
            }
            _ => {
                info!("No Telegram credentials, alerts go to the log only");
                Arc::new(LogNotifier)
            }
        };

    let detector = Arc::new(AnomalyDetector::new(cfg.clone(), store.clone(), notifier));
    let collector = Arc::new(TickCollector::new(
        cfg.clone(),
        Arc::clone(&venue),
        store.clone(),
        detector,
    ));

    info!(
        z_threshold = cfg.z_threshold,
        adaptive_gate = cfg.use_adaptive_thresholds,
        min_total_volume = cfg.min_total_volume,
        min_delta_volume = cfg.min_delta_volume,
        blocklist_entries = cfg.alert_title_blocklist.len(),
        blackout_windows = ?cfg.blackout_windows,
        "monitor starting"
    );

    // --- Startup sequence: one full refresh, one poll, then timers ---
    let refresher = CatalogRefresher::new(cfg.clone(), Arc::clone(&venue), store.clone());
    if let Err(e) = refresher.refresh().await {
        error!("initial catalog refresh failed: {e}");
    }
    info!("tracking {} markets", store.stream_count().await?);

    collector.poll_ticks().await;

    tokio::spawn(refresher.run());
    tokio::spawn(TickPoller::new(cfg.clone(), Arc::clone(&collector)).run());
    tokio::spawn(Heartbeat::new(started).run());

    // --- Status API ---
    let app = router(ApiState { store, started });
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
