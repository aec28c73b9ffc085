//! Per-minute tick collection: one price fetch and one volume fetch per
//! tracked market, fanned out in bounded batches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::client::{local_now_ms, Venue};
use crate::config::{Config, COLLECT_BATCH_SIZE};
use crate::db::Store;
use crate::detector::AnomalyDetector;
use crate::error::Result;
use crate::payload::{pick_f64, pick_timestamp_ms};
use crate::types::{MarketStream, Tick};

/// How one market's collection attempt ended. Skips are normal operation;
/// the market simply contributes no tick this minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectStatus {
    /// Accepted, evaluated by the detector, persisted to both tiers.
    Evaluated,
    /// Below both volume floors; persisted to the raw tier only.
    FilteredOut,
    /// Price or volume fetch produced no usable payload.
    NoPayload,
}

pub struct TickCollector {
    cfg: Arc<Config>,
    venue: Arc<dyn Venue>,
    store: Store,
    detector: Arc<AnomalyDetector>,
    in_flight: AtomicBool,
}

impl TickCollector {
    pub fn new(
        cfg: Arc<Config>,
        venue: Arc<dyn Venue>,
        store: Store,
        detector: Arc<AnomalyDetector>,
    ) -> Self {
        Self { cfg, venue, store, detector, in_flight: AtomicBool::new(false) }
    }

    /// Collect one tick for every tracked market. Non-reentrant: a poll that
    /// outruns its minute makes the next invocation return immediately.
    pub async fn poll_ticks(&self) {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            warn!("tick poll still running, skipping this round");
            return;
        }
        if let Err(e) = self.run_poll().await {
            error!("tick poll failed: {e}");
        }
        self.in_flight.store(false, Ordering::SeqCst);
    }

    async fn run_poll(&self) -> Result<()> {
        let streams = self.store.list_streams().await?;
        if streams.is_empty() {
            debug!("no tracked markets yet, nothing to poll");
            return Ok(());
        }

        let started = std::time::Instant::now();
        let mut evaluated = 0usize;
        let mut filtered = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;

        // Batches run to completion before the next one starts, bounding the
        // in-flight request count at two per market in the batch.
        for batch in streams.chunks(COLLECT_BATCH_SIZE) {
            let outcomes = join_all(batch.iter().map(|m| self.collect_tick(m))).await;
            for (market, outcome) in batch.iter().zip(outcomes) {
                match outcome {
                    Ok(CollectStatus::Evaluated) => evaluated += 1,
                    Ok(CollectStatus::FilteredOut) => filtered += 1,
                    Ok(CollectStatus::NoPayload) => skipped += 1,
                    Err(e) => {
                        failed += 1;
                        error!(market_id = market.market_id, "tick collection failed: {e}");
                    }
                }
            }
        }

        info!(
            markets = streams.len(),
            evaluated,
            filtered,
            skipped,
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tick poll complete"
        );
        Ok(())
    }

    /// One market: fetch price and volume, derive the delta, apply the
    /// acceptance gate, persist, and hand accepted ticks to the detector.
    pub async fn collect_tick(&self, market: &MarketStream) -> Result<CollectStatus> {
        let Some((price, ts)) = self.fetch_price(market).await else {
            debug!(market_id = market.market_id, "skipped (no payload)");
            return Ok(CollectStatus::NoPayload);
        };
        let Some(volume) = self.fetch_private_volume(market.market_id).await else {
            debug!(market_id = market.market_id, "skipped (no payload)");
            return Ok(CollectStatus::NoPayload);
        };

        let last = self.store.latest_raw_tick(market.market_id).await?;
        let raw_delta = match &last {
            Some(prev) => volume - prev.volume,
            None => 0.0,
        };
        if raw_delta < 0.0 {
            warn!(
                market_id = market.market_id,
                volume,
                last_volume = last.map(|t| t.volume).unwrap_or(0.0),
                "cumulative volume went backwards (upstream reset), clamping delta to 0"
            );
        }

        let tick = Tick {
            market_id: market.market_id,
            ts,
            yes_price: price,
            volume,
            delta_volume: raw_delta.max(0.0),
        };

        if tick.volume < self.cfg.min_total_volume && tick.delta_volume < self.cfg.min_delta_volume
        {
            self.store.insert_raw_only(&tick).await?;
            debug!(market_id = market.market_id, "skipped (filters)");
            return Ok(CollectStatus::FilteredOut);
        }

        // The detector runs first so a cold start seeds from history that
        // does not yet include this tick.
        let outcome = self.detector.evaluate(market, &tick).await?;
        self.store.insert_raw_and_filtered(&tick).await?;
        if outcome.is_alert() {
            debug!(market_id = market.market_id, "accepted tick raised an alert");
        }
        Ok(CollectStatus::Evaluated)
    }

    async fn fetch_price(&self, market: &MarketStream) -> Option<(f64, i64)> {
        let book = match self
            .venue
            .orderbook(&market.yes_token_id, &market.topic_id, market.chain_id)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                debug!(market_id = market.market_id, "orderbook fetch failed: {e}");
                return None;
            }
        };
        let price = best_price(&book)?;
        let ts = pick_timestamp_ms(&book).unwrap_or_else(local_now_ms);
        Some((price, ts))
    }

    /// Cumulative volume from the private market endpoint, detail first,
    /// list fallback second.
    async fn fetch_private_volume(&self, market_id: i64) -> Option<f64> {
        match self.venue.market_detail(market_id).await {
            Ok(v) => {
                if let Some(volume) = extract_volume(&v) {
                    return Some(volume);
                }
            }
            Err(e) => debug!(market_id, "market detail fetch failed: {e}"),
        }
        match self.venue.market_list(market_id).await {
            Ok(v) => extract_volume(&v),
            Err(e) => {
                debug!(market_id, "market list fallback failed: {e}");
                None
            }
        }
    }
}

/// Price of an orderbook payload: `last_price` when present and positive,
/// else the lowest ask, else the highest bid.
pub fn best_price(book: &Value) -> Option<f64> {
    if let Some(last) = pick_f64(book, &["last_price", "lastPrice"]) {
        if last > 0.0 {
            return Some(last);
        }
    }
    let lowest_ask = side_prices(book, &["asks", "ask"])
        .into_iter()
        .fold(None::<f64>, |best, p| Some(best.map_or(p, |b| b.min(p))));
    if let Some(ask) = lowest_ask {
        return Some(ask);
    }
    side_prices(book, &["bids", "bid"])
        .into_iter()
        .fold(None::<f64>, |best, p| Some(best.map_or(p, |b| b.max(p))))
}

/// Positive level prices of one book side. Levels arrive either as
/// `[price, size]` pairs or as objects with a `price` field.
fn side_prices(book: &Value, keys: &[&str]) -> Vec<f64> {
    let mut prices = Vec::new();
    for key in keys {
        if let Some(levels) = book.get(key).and_then(|v| v.as_array()) {
            for level in levels {
                let price = match level {
                    Value::Array(pair) => pair.first().and_then(crate::payload::as_f64),
                    other => pick_f64(other, &["price"]),
                };
                if let Some(p) = price {
                    if p > 0.0 {
                        prices.push(p);
                    }
                }
            }
            if !prices.is_empty() {
                break;
            }
        }
    }
    prices
}

/// Cumulative volume from a private market payload; the list fallback wraps
/// the market in a one-element array.
fn extract_volume(v: &Value) -> Option<f64> {
    let target = if let Some(items) = v.as_array() { items.first()? } else { v };
    pick_f64(target, &["volume", "totalVolume", "total_volume", "vol"])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
