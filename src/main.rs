// =============================================================================
// Helix Feed — Main Entry Point
// =============================================================================
//
// Wires the real-time market-data distribution layer: one streaming
// connection with reconnect/backoff and heartbeat, durable subscription
// intent, listener fan-out, and tick-to-candle aggregation for live charts.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod error;
mod feed;
mod history;
mod indicators;
mod market_data;
mod protocol;
mod runtime_config;
mod session;
mod transport;
mod types;

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::feed::MarketFeed;
use crate::history::RestHistoryProvider;
use crate::market_data::SeriesEvent;
use crate::runtime_config::FeedConfig;
use crate::session::SessionHandle;
use crate::transport::WsTransport;
use crate::types::{FeedNotification, Tick};

const CONFIG_PATH: &str = "feed_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Helix Feed — Starting Up                          ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = FeedConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        FeedConfig::default()
    });

    // Override instruments from env if available.
    if let Ok(syms) = std::env::var("HELIX_INSTRUMENTS") {
        config.instruments = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Ok(url) = std::env::var("HELIX_FEED_URL") {
        config.feed_url = url;
    }

    info!(instruments = ?config.instruments, feed_url = %config.feed_url, "Configured feed");

    // ── 2. Session credential ────────────────────────────────────────────
    let session = SessionHandle::from_env("HELIX_ACCESS_TOKEN");
    if session.credential().is_none() {
        warn!("No HELIX_ACCESS_TOKEN set — connect will be refused until a credential arrives");
    }

    // ── 3. Build the feed ────────────────────────────────────────────────
    let feed = MarketFeed::spawn(&config, Arc::new(WsTransport), &session);

    // ── 4. Seed chart series from history ────────────────────────────────
    let history = RestHistoryProvider::new(config.history_url.clone());
    let chart_timeframes = config.chart_timeframes();
    for instrument in &config.instruments {
        for timeframe in &chart_timeframes {
            feed.seed_from_history(&history, instrument, timeframe, config.history_limit)
                .await;
        }
    }

    // ── 5. In-process consumers (the stand-ins for dashboard views) ──────
    for instrument in &config.instruments {
        let _handle = feed.add_market_data_listener(instrument, |tick: &Tick| {
            debug!(symbol = %tick.instrument, price = tick.price, "tick");
        });
    }

    let mut series_updates = feed.aggregator().updates();
    tokio::spawn(async move {
        loop {
            match series_updates.recv().await {
                Ok(update) => match update.event {
                    SeriesEvent::Opened(candle) => {
                        info!(
                            series = %update.key,
                            open_time = candle.open_time,
                            open = candle.open,
                            "new candle opened"
                        );
                    }
                    SeriesEvent::Updated(candle) => {
                        debug!(series = %update.key, close = candle.close, "candle updated");
                    }
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "series consumer lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut notifications = feed.notifications();
    tokio::spawn(async move {
        while let Ok(notification) = notifications.recv().await {
            match notification {
                FeedNotification::ServerError { message } => {
                    warn!(message = %message, "server reported an error");
                }
                FeedNotification::ConnectionLost { attempts } => {
                    error!(
                        attempts,
                        "connection lost for good — a manual reconnect is required"
                    );
                }
            }
        }
    });

    let mut status = feed.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let snapshot = status.borrow_and_update().clone();
            info!(
                state = %snapshot.state,
                attempt = snapshot.reconnect_attempt,
                exhausted = snapshot.retries_exhausted,
                "connection status"
            );
        }
    });

    // ── 6. Connect & subscribe ───────────────────────────────────────────
    feed.connect();
    for instrument in &config.instruments {
        feed.subscribe(instrument);
    }

    info!("Feed running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    feed.disconnect();
    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save feed config on shutdown");
    }

    info!("Helix Feed shut down complete.");
    Ok(())
}
