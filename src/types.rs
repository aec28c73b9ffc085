use serde::{Deserialize, Serialize};

/// Market type value for multi-outcome parents.
pub const MULTI_PARENT: i64 = 1;

// ---------------------------------------------------------------------------
// MarketStream
// ---------------------------------------------------------------------------

/// A tracked binary-outcome market, as reconciled by the catalog walker.
///
/// Multi-outcome parents live in the same table as their children; they have
/// no tradable YES token of their own and carry a synthetic placeholder
/// (`multi-parent-<market_id>`) instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketStream {
    pub market_id: i64,
    pub yes_token_id: String,
    pub title: String,
    pub parent_market_id: Option<i64>,
    /// The venue's "question" identifier. For multi-outcome parents on
    /// alternate chains this can differ from `market_id`.
    pub topic_id: String,
    pub market_type: Option<i64>,
    pub chain_id: Option<i64>,
    /// Millisecond epoch after which the market no longer trades.
    pub cutoff_at: Option<i64>,
    /// Millisecond epoch of the last catalog reconcile.
    pub updated_at: i64,
}

impl MarketStream {
    /// Placeholder token for multi-outcome parents, so a single table can
    /// hold both kinds of descriptor.
    pub fn synthetic_token(market_id: i64) -> String {
        format!("multi-parent-{market_id}")
    }
}

// ---------------------------------------------------------------------------
// Tick
// ---------------------------------------------------------------------------

/// One sampled observation for a market.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Tick {
    pub market_id: i64,
    /// Millisecond epoch, taken from the orderbook payload.
    pub ts: i64,
    /// YES price, ~[0,1] in normal operation (upper bound not enforced).
    pub yes_price: f64,
    /// Cumulative traded volume as reported upstream.
    pub volume: f64,
    /// Non-negative increment since the previous raw tick. Negative raw
    /// observations (upstream reset) clamp to zero.
    pub delta_volume: f64,
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// What the detector hands to the notifier alongside the market and tick.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Detection {
    pub price_z: f64,
    pub volume_z: f64,
    pub adjusted_score: f64,
    pub price_change: f64,
    pub prev_price: f64,
    pub adaptive_threshold: f64,
}

/// Result of running one accepted tick through the detector. Every variant
/// short of `Alerted` leaves alert state untouched.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Estimator still warming up (`tick_count` below the detection floor).
    Warmup,
    /// No usable previous price (first tick after a cold start).
    NoPrevPrice,
    /// |Δ| under the zone's minimum price change.
    BelowChangeGate,
    /// Adjusted score under the Z threshold.
    BelowScore,
    /// Title matched the blocklist.
    Blocklisted,
    /// Inside the per-market cooldown window.
    CoolingDown,
    /// Same alert hash within the duplicate window.
    Duplicate,
    /// Notifier returned an error; cooldown not started.
    NotifyFailed,
    Alerted(Detection),
}

impl Outcome {
    pub fn is_alert(&self) -> bool {
        matches!(self, Outcome::Alerted(_))
    }
}
