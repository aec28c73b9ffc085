pub mod models;

use sqlx::SqlitePool;

use crate::config::{FILTERED_TICK_RETENTION, RAW_TICK_RETENTION};
use crate::detector::ewma::EwmaState;
use crate::error::Result;
use crate::types::{MarketStream, Tick};
use models::{AlertRow, AlertSummaryRow, EwmaRow, StreamRow, TickRow};

/// All durable state lives here: market descriptors, the two-tier tick
/// history, estimator state, and alert cooldown state.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // -----------------------------------------------------------------------
    // Streams
    // -----------------------------------------------------------------------

    pub async fn upsert_stream(&self, m: &MarketStream) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO streams (
                market_id, yes_token_id, title, parent_market_id,
                topic_id, market_type, chain_id, cutoff_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(market_id) DO UPDATE SET
                yes_token_id = excluded.yes_token_id,
                title = excluded.title,
                parent_market_id = excluded.parent_market_id,
                topic_id = excluded.topic_id,
                market_type = excluded.market_type,
                chain_id = excluded.chain_id,
                cutoff_at = excluded.cutoff_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(m.market_id)
        .bind(&m.yes_token_id)
        .bind(&m.title)
        .bind(m.parent_market_id)
        .bind(&m.topic_id)
        .bind(m.market_type)
        .bind(m.chain_id)
        .bind(m.cutoff_at)
        .bind(m.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_streams(&self) -> Result<Vec<MarketStream>> {
        let rows: Vec<StreamRow> =
            sqlx::query_as("SELECT * FROM streams ORDER BY market_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn get_stream(&self, market_id: i64) -> Result<Option<MarketStream>> {
        let row: Option<StreamRow> =
            sqlx::query_as("SELECT * FROM streams WHERE market_id = ?")
                .bind(market_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Into::into))
    }

    pub async fn stream_count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM streams")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    // -----------------------------------------------------------------------
    // Ticks
    // -----------------------------------------------------------------------

    /// Most recent raw tick for a market: the `last volume` reference for
    /// delta computation.
    pub async fn latest_raw_tick(&self, market_id: i64) -> Result<Option<Tick>> {
        let row: Option<TickRow> = sqlx::query_as(
            "SELECT market_id, ts, yes_price, volume, delta_volume
             FROM raw_ticks WHERE market_id = ? ORDER BY ts DESC, id DESC LIMIT 1",
        )
        .bind(market_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Append to the raw table only (observation failed the acceptance gate).
    pub async fn insert_raw_only(&self, t: &Tick) -> Result<()> {
        let mut txn = self.pool.begin().await?;
        insert_tick(&mut txn, "raw_ticks", t).await?;
        prune_ticks(&mut txn, "raw_ticks", t.market_id, RAW_TICK_RETENTION).await?;
        txn.commit().await?;
        Ok(())
    }

    /// Append the same row to raw and filtered in one transaction, so the
    /// two retentions stay matched.
    pub async fn insert_raw_and_filtered(&self, t: &Tick) -> Result<()> {
        let mut txn = self.pool.begin().await?;
        insert_tick(&mut txn, "raw_ticks", t).await?;
        prune_ticks(&mut txn, "raw_ticks", t.market_id, RAW_TICK_RETENTION).await?;
        insert_tick(&mut txn, "filtered_ticks", t).await?;
        prune_ticks(&mut txn, "filtered_ticks", t.market_id, FILTERED_TICK_RETENTION).await?;
        txn.commit().await?;
        Ok(())
    }

    /// Filtered history oldest-first, for seeding the estimator.
    pub async fn recent_filtered_oldest_first(
        &self,
        market_id: i64,
        limit: i64,
    ) -> Result<Vec<Tick>> {
        let mut rows: Vec<TickRow> = sqlx::query_as(
            "SELECT market_id, ts, yes_price, volume, delta_volume
             FROM filtered_ticks WHERE market_id = ? ORDER BY ts DESC, id DESC LIMIT ?",
        )
        .bind(market_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.reverse();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Raw history newest-first, for chart rendering by a notifier.
    pub async fn recent_raw(&self, market_id: i64, limit: i64) -> Result<Vec<Tick>> {
        let rows: Vec<TickRow> = sqlx::query_as(
            "SELECT market_id, ts, yes_price, volume, delta_volume
             FROM raw_ticks WHERE market_id = ? ORDER BY ts DESC, id DESC LIMIT ?",
        )
        .bind(market_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    // -----------------------------------------------------------------------
    // Estimator state
    // -----------------------------------------------------------------------

    pub async fn load_ewma(&self, market_id: i64) -> Result<Option<EwmaState>> {
        let row: Option<EwmaRow> = sqlx::query_as(
            "SELECT price_mean, price_var, volume_mean, volume_var, last_price, tick_count
             FROM ewma_state WHERE market_id = ?",
        )
        .bind(market_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn save_ewma(&self, market_id: i64, state: &EwmaState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ewma_state (
                market_id, price_mean, price_var, volume_mean, volume_var,
                last_price, tick_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(market_id) DO UPDATE SET
                price_mean = excluded.price_mean,
                price_var = excluded.price_var,
                volume_mean = excluded.volume_mean,
                volume_var = excluded.volume_var,
                last_price = excluded.last_price,
                tick_count = excluded.tick_count
            "#,
        )
        .bind(market_id)
        .bind(state.price_mean)
        .bind(state.price_var)
        .bind(state.volume_mean)
        .bind(state.volume_var)
        .bind(state.last_price)
        .bind(state.tick_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Alert state
    // -----------------------------------------------------------------------

    pub async fn load_alert(&self, market_id: i64) -> Result<Option<AlertRow>> {
        let row: Option<AlertRow> = sqlx::query_as(
            "SELECT last_alert_at, last_alert_hash FROM alerts WHERE market_id = ?",
        )
        .bind(market_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn save_alert(&self, market_id: i64, at: i64, hash: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alerts (market_id, last_alert_at, last_alert_hash)
            VALUES (?, ?, ?)
            ON CONFLICT(market_id) DO UPDATE SET
                last_alert_at = excluded.last_alert_at,
                last_alert_hash = excluded.last_alert_hash
            "#,
        )
        .bind(market_id)
        .bind(at)
        .bind(hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_alerts(&self, limit: i64) -> Result<Vec<AlertSummaryRow>> {
        let rows: Vec<AlertSummaryRow> = sqlx::query_as(
            r#"
            SELECT a.market_id, s.title, a.last_alert_at, a.last_alert_hash
            FROM alerts a
            JOIN streams s ON s.market_id = a.market_id
            WHERE a.last_alert_at IS NOT NULL
            ORDER BY a.last_alert_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

async fn insert_tick(
    txn: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    table: &str,
    t: &Tick,
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {table} (market_id, ts, yes_price, volume, delta_volume)
         VALUES (?, ?, ?, ?, ?)"
    );
    sqlx::query(&sql)
        .bind(t.market_id)
        .bind(t.ts)
        .bind(t.yes_price)
        .bind(t.volume)
        .bind(t.delta_volume)
        .execute(&mut **txn)
        .await?;
    Ok(())
}

/// Keep only the newest `keep` rows for the market, by `(ts, id)`.
async fn prune_ticks(
    txn: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    table: &str,
    market_id: i64,
    keep: i64,
) -> Result<()> {
    let sql = format!(
        "DELETE FROM {table} WHERE market_id = ?1 AND id NOT IN (
             SELECT id FROM {table} WHERE market_id = ?1
             ORDER BY ts DESC, id DESC LIMIT ?2
         )"
    );
    sqlx::query(&sql)
        .bind(market_id)
        .bind(keep)
        .execute(&mut **txn)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    pub(crate) async fn test_store() -> Store {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        sqlx::migrate!("./migrations").run(&pool).await.expect("migrations");
        Store::new(pool)
    }

    fn tick(market_id: i64, ts: i64, price: f64, volume: f64, delta: f64) -> Tick {
        Tick { market_id, ts, yes_price: price, volume, delta_volume: delta }
    }

    fn stream(market_id: i64) -> MarketStream {
        MarketStream {
            market_id,
            yes_token_id: format!("tok-{market_id}"),
            title: format!("Will outcome {market_id} happen?"),
            parent_market_id: None,
            topic_id: market_id.to_string(),
            market_type: Some(0),
            chain_id: Some(56),
            cutoff_at: Some(1_900_000_000_000),
            updated_at: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn stream_upsert_round_trips_all_fields() {
        let store = test_store().await;
        let m = stream(7);
        store.upsert_stream(&m).await.unwrap();

        let back = store.get_stream(7).await.unwrap().expect("stream present");
        assert_eq!(back, m);

        // Upsert replaces, never duplicates.
        let mut renamed = m.clone();
        renamed.title = "renamed".to_string();
        renamed.updated_at += 60_000;
        store.upsert_stream(&renamed).await.unwrap();
        let all = store.list_streams().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "renamed");
    }

    #[tokio::test]
    async fn filtered_rows_are_a_subsequence_of_raw() {
        let store = test_store().await;
        for i in 0..10i64 {
            let t = tick(1, 1000 + i, 0.5, 100.0 * i as f64, 10.0);
            if i % 3 == 0 {
                store.insert_raw_and_filtered(&t).await.unwrap();
            } else {
                store.insert_raw_only(&t).await.unwrap();
            }
        }

        let raw = store.recent_raw(1, 400).await.unwrap();
        let filtered = store.recent_filtered_oldest_first(1, 120).await.unwrap();
        assert_eq!(raw.len(), 10);
        assert_eq!(filtered.len(), 4);

        // Every filtered row appears in raw with identical fields.
        for f in &filtered {
            assert!(raw.iter().any(|r| r == f), "filtered tick missing from raw: {f:?}");
        }
    }

    #[tokio::test]
    async fn retention_keeps_newest_rows_per_market() {
        let store = test_store().await;
        for i in 0..(RAW_TICK_RETENTION + 5) {
            store
                .insert_raw_only(&tick(1, 1000 + i, 0.5, i as f64, 1.0))
                .await
                .unwrap();
        }
        // A second market is unaffected by the first market's pruning.
        store.insert_raw_only(&tick(2, 1, 0.5, 0.0, 0.0)).await.unwrap();

        let raw = store.recent_raw(1, 10_000).await.unwrap();
        assert_eq!(raw.len() as i64, RAW_TICK_RETENTION);
        // Oldest rows were the ones dropped.
        assert!(raw.iter().all(|t| t.ts >= 1005));
        assert_eq!(store.recent_raw(2, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn latest_raw_tick_is_newest_by_ts() {
        let store = test_store().await;
        store.insert_raw_only(&tick(1, 100, 0.4, 1000.0, 0.0)).await.unwrap();
        store.insert_raw_only(&tick(1, 200, 0.6, 1200.0, 200.0)).await.unwrap();

        let latest = store.latest_raw_tick(1).await.unwrap().unwrap();
        assert_eq!(latest.ts, 200);
        assert_eq!(latest.volume, 1200.0);
        assert!(store.latest_raw_tick(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ewma_and_alert_state_round_trip() {
        let store = test_store().await;
        assert!(store.load_ewma(1).await.unwrap().is_none());

        let state = EwmaState {
            price_mean: 0.5,
            price_var: 0.001,
            volume_mean: 40.0,
            volume_var: 25.0,
            last_price: 0.51,
            tick_count: 21,
        };
        store.save_ewma(1, &state).await.unwrap();
        let back = store.load_ewma(1).await.unwrap().unwrap();
        assert_eq!(back.tick_count, 21);
        assert!((back.price_mean - 0.5).abs() < 1e-12);
        assert!((back.last_price - 0.51).abs() < 1e-12);

        assert!(store.load_alert(1).await.unwrap().is_none());
        store.save_alert(1, 1_700_000_000_000, "1|3.10|0.190").await.unwrap();
        let alert = store.load_alert(1).await.unwrap().unwrap();
        assert_eq!(alert.last_alert_at, Some(1_700_000_000_000));
        assert_eq!(alert.last_alert_hash.as_deref(), Some("1|3.10|0.190"));
    }

    #[tokio::test]
    async fn recent_alerts_joins_titles() {
        let store = test_store().await;
        store.upsert_stream(&stream(5)).await.unwrap();
        store.save_alert(5, 42, "h").await.unwrap();

        let alerts = store.recent_alerts(10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].market_id, 5);
        assert!(alerts[0].title.contains("outcome 5"));
    }
}
