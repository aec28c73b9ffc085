pub mod ewma;

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::client::local_now_ms;
use crate::config::{
    Config, ALERT_COOLDOWN_MS, DUPLICATE_ALERT_WINDOW_MS, FILTERED_TICK_RETENTION,
    MIN_TICKS_FOR_DETECTION,
};
use crate::db::Store;
use crate::error::Result;
use crate::notifier::Notifier;
use crate::types::{Detection, MarketStream, Outcome, Tick};
use ewma::{adjusted_score, min_price_change, EwmaState};

/// Per-market anomaly detection over accepted ticks. Owns no long-lived
/// state of its own; estimator and alert state round-trip through the
/// store, so a restart picks up where the last poll left off.
pub struct AnomalyDetector {
    cfg: Arc<Config>,
    store: Store,
    notifier: Arc<dyn Notifier>,
}

impl AnomalyDetector {
    pub fn new(cfg: Arc<Config>, store: Store, notifier: Arc<dyn Notifier>) -> Self {
        Self { cfg, store, notifier }
    }

    /// Run one accepted tick through the decision sequence. The estimator is
    /// always advanced and persisted, trigger or not; only a successful
    /// notification touches alert state.
    pub async fn evaluate(&self, market: &MarketStream, tick: &Tick) -> Result<Outcome> {
        let mut state = match self.store.load_ewma(market.market_id).await? {
            Some(state) => state,
            None => {
                let history = self
                    .store
                    .recent_filtered_oldest_first(market.market_id, FILTERED_TICK_RETENTION)
                    .await?;
                let state = EwmaState::seed(&history);
                debug!(
                    market_id = market.market_id,
                    seed_ticks = state.tick_count,
                    "estimator cold start"
                );
                state
            }
        };

        if state.tick_count < MIN_TICKS_FOR_DETECTION {
            state.update(tick.yes_price, tick.delta_volume);
            self.store.save_ewma(market.market_id, &state).await?;
            return Ok(Outcome::Warmup);
        }

        // Everything decision-relevant is read against the pre-update
        // moments; the new extreme must not move its own baseline first.
        let prev_price = state.last_price;
        let (price_z, volume_z) = state.zscores(tick.yes_price, tick.delta_volume);
        let score = adjusted_score(price_z, volume_z, self.cfg.volume_boost_factor);
        let change = tick.yes_price - prev_price;

        state.update(tick.yes_price, tick.delta_volume);
        self.store.save_ewma(market.market_id, &state).await?;

        if prev_price <= 0.0 {
            return Ok(Outcome::NoPrevPrice);
        }

        let gate = min_price_change(prev_price, &self.cfg);
        if change.abs() < gate {
            return Ok(Outcome::BelowChangeGate);
        }

        if score < self.cfg.z_threshold {
            return Ok(Outcome::BelowScore);
        }

        if self.is_blocklisted(market).await? {
            debug!(market_id = market.market_id, title = %market.title, "alert blocklisted");
            return Ok(Outcome::Blocklisted);
        }

        let hash = alert_hash(market.market_id, score, change);
        let now = local_now_ms();
        if let Some(alert) = self.store.load_alert(market.market_id).await? {
            if let Some(last_at) = alert.last_alert_at {
                if now - last_at < ALERT_COOLDOWN_MS {
                    return Ok(Outcome::CoolingDown);
                }
                if alert.last_alert_hash.as_deref() == Some(hash.as_str())
                    && now - last_at < DUPLICATE_ALERT_WINDOW_MS
                {
                    return Ok(Outcome::Duplicate);
                }
            }
        }

        let detection = Detection {
            price_z,
            volume_z,
            adjusted_score: score,
            price_change: change,
            prev_price,
            adaptive_threshold: gate,
        };

        match self.notifier.notify(market, tick, &detection).await {
            Ok(()) => {
                self.store.save_alert(market.market_id, now, &hash).await?;
                info!(
                    market_id = market.market_id,
                    title = %market.title,
                    score = format_args!("{score:.2}"),
                    change = format_args!("{change:+.3}"),
                    "anomaly alert sent"
                );
                Ok(Outcome::Alerted(detection))
            }
            Err(e) => {
                error!(market_id = market.market_id, "notifier failed, cooldown not started: {e}");
                Ok(Outcome::NotifyFailed)
            }
        }
    }

    /// Title blocklist over the market itself, plus its parent when both
    /// sit on the same chain.
    async fn is_blocklisted(&self, market: &MarketStream) -> Result<bool> {
        if self.title_matches(&market.title) {
            return Ok(true);
        }
        if let Some(parent_id) = market.parent_market_id {
            if let Some(parent) = self.store.get_stream(parent_id).await? {
                if parent.chain_id == market.chain_id && self.title_matches(&parent.title) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn title_matches(&self, title: &str) -> bool {
        let lowered = title.to_lowercase();
        if self.cfg.alert_title_blocklist.iter().any(|needle| lowered.contains(needle)) {
            return true;
        }
        self.cfg
            .alert_title_blocklist_regex
            .as_ref()
            .map(|re| re.is_match(title))
            .unwrap_or(false)
    }
}

/// Duplicate-suppression key: market plus the rounded shape of the event.
fn alert_hash(market_id: i64, score: f64, change: f64) -> String {
    format!("{market_id}|{score:.2}|{:.3}", change.abs())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
