//! Database row types. Used by sqlx for typed `query_as` reads.

use crate::detector::ewma::EwmaState;
use crate::types::{MarketStream, Tick};

#[derive(Debug, sqlx::FromRow)]
pub struct StreamRow {
    pub market_id: i64,
    pub yes_token_id: String,
    pub title: String,
    pub parent_market_id: Option<i64>,
    pub topic_id: String,
    pub market_type: Option<i64>,
    pub chain_id: Option<i64>,
    pub cutoff_at: Option<i64>,
    pub updated_at: i64,
}

impl From<StreamRow> for MarketStream {
    fn from(r: StreamRow) -> Self {
        MarketStream {
            market_id: r.market_id,
            yes_token_id: r.yes_token_id,
            title: r.title,
            parent_market_id: r.parent_market_id,
            topic_id: r.topic_id,
            market_type: r.market_type,
            chain_id: r.chain_id,
            cutoff_at: r.cutoff_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct TickRow {
    pub market_id: i64,
    pub ts: i64,
    pub yes_price: f64,
    pub volume: f64,
    pub delta_volume: f64,
}

impl From<TickRow> for Tick {
    fn from(r: TickRow) -> Self {
        Tick {
            market_id: r.market_id,
            ts: r.ts,
            yes_price: r.yes_price,
            volume: r.volume,
            delta_volume: r.delta_volume,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct EwmaRow {
    pub price_mean: f64,
    pub price_var: f64,
    pub volume_mean: f64,
    pub volume_var: f64,
    pub last_price: f64,
    pub tick_count: i64,
}

impl From<EwmaRow> for EwmaState {
    fn from(r: EwmaRow) -> Self {
        EwmaState {
            price_mean: r.price_mean,
            price_var: r.price_var,
            volume_mean: r.volume_mean,
            volume_var: r.volume_var,
            last_price: r.last_price,
            tick_count: r.tick_count,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AlertRow {
    pub last_alert_at: Option<i64>,
    pub last_alert_hash: Option<String>,
}

/// Joined view for the status API's recent-alerts listing.
#[derive(Debug, sqlx::FromRow, serde::Serialize)]
pub struct AlertSummaryRow {
    pub market_id: i64,
    pub title: String,
    pub last_alert_at: i64,
    pub last_alert_hash: Option<String>,
}
