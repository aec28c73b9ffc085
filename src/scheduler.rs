//! Periodic drivers: hourly catalog refresh, minutely tick polls with
//! blackout windows, and a five-minute heartbeat.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tracing::{error, info};

use crate::catalog::CatalogWalker;
use crate::client::{local_now_ms, Venue};
use crate::collector::TickCollector;
use crate::config::{
    Config, CATALOG_REFRESH_INTERVAL_SECS, HEARTBEAT_INTERVAL_SECS, TICK_POLL_INTERVAL_SECS,
};
use crate::db::Store;
use crate::error::Result;

/// Re-walks the catalog every hour and upserts every emitted descriptor.
pub struct CatalogRefresher {
    cfg: Arc<Config>,
    venue: Arc<dyn Venue>,
    store: Store,
}

impl CatalogRefresher {
    pub fn new(cfg: Arc<Config>, venue: Arc<dyn Venue>, store: Store) -> Self {
        Self { cfg, venue, store }
    }

    pub async fn run(self) {
        let mut ticker = interval(Duration::from_secs(CATALOG_REFRESH_INTERVAL_SECS));
        ticker.tick().await; // skip immediate first tick, startup already refreshed

        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh().await {
                error!("catalog refresh failed: {e}");
            }
        }
    }

    /// One full walk. Each descriptor lands with a fresh `updated_at`;
    /// individual upsert failures are logged and skipped.
    pub async fn refresh(&self) -> Result<()> {
        let started = Instant::now();
        let streams = CatalogWalker::new(self.venue.as_ref(), &self.cfg).walk().await?;
        let now = local_now_ms();

        let mut upserted = 0usize;
        let mut failed = 0usize;
        for mut stream in streams {
            stream.updated_at = now;
            match self.store.upsert_stream(&stream).await {
                Ok(()) => upserted += 1,
                Err(e) => {
                    failed += 1;
                    error!(market_id = stream.market_id, "stream upsert failed: {e}");
                }
            }
        }

        info!(
            upserted,
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "catalog refresh complete"
        );
        Ok(())
    }
}

/// Fires the collector every minute, except inside blackout windows. The
/// collector's own non-reentrancy flag handles polls that outrun a minute.
pub struct TickPoller {
    cfg: Arc<Config>,
    collector: Arc<TickCollector>,
}

impl TickPoller {
    pub fn new(cfg: Arc<Config>, collector: Arc<TickCollector>) -> Self {
        Self { cfg, collector }
    }

    pub async fn run(self) {
        let mut ticker = interval(Duration::from_secs(TICK_POLL_INTERVAL_SECS));
        ticker.tick().await; // startup already polled once

        loop {
            ticker.tick().await;
            let minute = minute_of_hour(local_now_ms());
            if self.cfg.in_blackout(minute) {
                info!(minute, "tick poll suppressed (blackout window)");
                continue;
            }
            self.collector.poll_ticks().await;
        }
    }
}

pub fn minute_of_hour(now_ms: i64) -> u32 {
    ((now_ms / 60_000) % 60) as u32
}

/// Emits an "alive" record with process uptime every five minutes.
pub struct Heartbeat {
    started: Instant,
}

impl Heartbeat {
    pub fn new(started: Instant) -> Self {
        Self { started }
    }

    pub async fn run(self) {
        let mut ticker = interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let uptime = self.started.elapsed();
            info!(
                uptime_secs = uptime.as_secs(),
                "alive | uptime {}h{:02}m",
                uptime.as_secs() / 3600,
                (uptime.as_secs() % 3600) / 60,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minute_of_hour_wraps_on_the_hour() {
        // 1970-01-01 00:59:30
        assert_eq!(minute_of_hour(59 * 60_000 + 30_000), 59);
        // exactly on the hour
        assert_eq!(minute_of_hour(3_600_000), 0);
        // 26 minutes past some much later hour
        assert_eq!(minute_of_hour(1_700_000_000_000 + 26 * 60_000 - 1_700_000_000_000 % 3_600_000), 26);
    }
}
