//! Status API: a read-only window into the store for dashboards and
//! liveness probes.

use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::db::models::AlertSummaryRow;
use crate::db::Store;
use crate::error::AppError;
use crate::types::{MarketStream, Tick};

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub started: Instant,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/markets", get(get_markets))
        .route("/markets/:id/ticks", get(get_market_ticks))
        .route("/alerts/recent", get(get_recent_alerts))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    uptime_secs: u64,
    tracked_markets: i64,
}

async fn get_health(State(state): State<ApiState>) -> Result<Json<HealthResponse>, AppError> {
    let tracked_markets = state.store.stream_count().await?;
    Ok(Json(HealthResponse {
        uptime_secs: state.started.elapsed().as_secs(),
        tracked_markets,
    }))
}

async fn get_markets(State(state): State<ApiState>) -> Result<Json<Vec<MarketStream>>, AppError> {
    Ok(Json(state.store.list_streams().await?))
}

#[derive(Deserialize)]
struct MarketTicksQuery {
    limit: Option<i64>,
}

/// Raw history newest-first, the shape a chart renderer would consume.
async fn get_market_ticks(
    State(state): State<ApiState>,
    Path(market_id): Path<i64>,
    Query(params): Query<MarketTicksQuery>,
) -> Result<Json<Vec<Tick>>, AppError> {
    let limit = params.limit.unwrap_or(120).clamp(1, 400);
    Ok(Json(state.store.recent_raw(market_id, limit).await?))
}

#[derive(Deserialize)]
struct RecentAlertsQuery {
    limit: Option<i64>,
}

async fn get_recent_alerts(
    State(state): State<ApiState>,
    Query(params): Query<RecentAlertsQuery>,
) -> Result<Json<Vec<AlertSummaryRow>>, AppError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    Ok(Json(state.store.recent_alerts(limit).await?))
}
