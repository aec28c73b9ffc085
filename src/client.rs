use std::num::NonZeroU32;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::config::{
    Config, MAX_CONCURRENT_REQUESTS, MIN_REQUEST_SPACING_MS, RATE_LIMIT_PER_SEC, REQUEST_TIMEOUT_SECS,
    RETRY_BACKOFF_MS, SERVER_TIME_TTL_SECS,
};
use crate::error::Result;
use crate::payload;

/// The upstream venue as the core consumes it. Implementations return the
/// unwrapped payload (envelope already stripped, non-zero `errno`/`code`
/// surfaced as `AppError::Upstream`).
#[async_trait]
pub trait Venue: Send + Sync {
    /// One page of the activated-topics listing.
    async fn topic_page(&self, page: u32, limit: u32) -> Result<Value>;
    /// Single-topic detail.
    async fn topic_detail(&self, topic_id: &str) -> Result<Value>;
    /// Multi-outcome topic detail (separate endpoint, same path shape).
    async fn multi_detail(&self, topic_id: &str) -> Result<Value>;
    /// Public orderbook / last price for a YES token.
    async fn orderbook(&self, token_id: &str, topic_id: &str, chain_id: Option<i64>)
        -> Result<Value>;
    /// Private market detail keyed by market id.
    async fn market_detail(&self, market_id: i64) -> Result<Value>;
    /// Private market list fallback (`?marketId=`).
    async fn market_list(&self, market_id: i64) -> Result<Value>;
    /// The venue's clock in millisecond epoch; local wall clock when the
    /// time endpoint is unavailable.
    async fn now_ms(&self) -> i64;
}

/// Millisecond epoch from the local wall clock.
pub fn local_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

struct ServerTimeCache {
    server_ms: i64,
    fetched_at: Instant,
}

/// HTTP client for the venue. Every request passes one gate: a token bucket
/// refilling 12/s, at most 6 requests in flight, and ~85 ms between request
/// starts. Connect timeouts and 5xx responses get a single retry after a
/// short backoff; everything else propagates on the first attempt.
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    private_base_url: String,
    bucket: DefaultDirectRateLimiter,
    in_flight: Semaphore,
    last_start: Mutex<Instant>,
    server_time: Mutex<Option<ServerTimeCache>>,
}

impl UpstreamClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        let per_sec = NonZeroU32::new(RATE_LIMIT_PER_SEC).expect("rate limit must be non-zero");
        Ok(Self {
            http,
            base_url: cfg.upstream_api_url.trim_end_matches('/').to_string(),
            private_base_url: cfg.upstream_private_api_url.trim_end_matches('/').to_string(),
            bucket: RateLimiter::direct(Quota::per_second(per_sec)),
            in_flight: Semaphore::new(MAX_CONCURRENT_REQUESTS),
            last_start: Mutex::new(Instant::now() - Duration::from_secs(1)),
            server_time: Mutex::new(None),
        })
    }

    /// Rate-gated GET returning the unwrapped payload.
    async fn get(&self, base: &str, path: &str, params: &[(&str, String)]) -> Result<Value> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .expect("request semaphore closed");
        self.bucket.until_ready().await;
        self.enforce_spacing().await;

        let url = format!("{base}{path}");
        let raw = self.send_with_retry(&url, params).await?;
        payload::unwrap_envelope(raw)
    }

    async fn enforce_spacing(&self) {
        let spacing = Duration::from_millis(MIN_REQUEST_SPACING_MS);
        let mut last = self.last_start.lock().await;
        let since = last.elapsed();
        if since < spacing {
            tokio::time::sleep(spacing - since).await;
        }
        *last = Instant::now();
    }

    async fn send_with_retry(&self, url: &str, params: &[(&str, String)]) -> Result<Value> {
        let mut retried = false;
        loop {
            let outcome = self.http.get(url).query(params).send().await;
            match outcome {
                Ok(resp) if resp.status().is_server_error() && !retried => {
                    warn!(url, status = %resp.status(), "upstream 5xx, retrying once");
                    retried = true;
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS)).await;
                }
                Ok(resp) => {
                    let resp = resp.error_for_status()?;
                    return Ok(resp.json::<Value>().await?);
                }
                Err(e) if (e.is_timeout() || e.is_connect()) && !retried => {
                    warn!(url, "connect failure, retrying once: {e}");
                    retried = true;
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl Venue for UpstreamClient {
    async fn topic_page(&self, page: u32, limit: u32) -> Result<Value> {
        self.get(
            &self.base_url,
            "/topics",
            &[
                ("statusEnum", "Activated".to_string()),
                ("page", page.to_string()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    async fn topic_detail(&self, topic_id: &str) -> Result<Value> {
        self.get(&self.base_url, &format!("/topics/{topic_id}"), &[]).await
    }

    async fn multi_detail(&self, topic_id: &str) -> Result<Value> {
        self.get(&self.base_url, &format!("/multi-topics/{topic_id}"), &[]).await
    }

    async fn orderbook(
        &self,
        token_id: &str,
        topic_id: &str,
        chain_id: Option<i64>,
    ) -> Result<Value> {
        let mut params = vec![
            ("symbol", token_id.to_string()),
            ("question_id", topic_id.to_string()),
            ("symbol_types", "0".to_string()),
        ];
        if let Some(chain) = chain_id {
            params.push(("chainId", chain.to_string()));
        }
        self.get(&self.base_url, "/orderbook", &params).await
    }

    async fn market_detail(&self, market_id: i64) -> Result<Value> {
        self.get(&self.private_base_url, &format!("/market/{market_id}"), &[]).await
    }

    async fn market_list(&self, market_id: i64) -> Result<Value> {
        self.get(
            &self.private_base_url,
            "/market",
            &[("marketId", market_id.to_string())],
        )
        .await
    }

    async fn now_ms(&self) -> i64 {
        let mut cache = self.server_time.lock().await;
        if let Some(entry) = cache.as_ref() {
            let age = entry.fetched_at.elapsed();
            if age < Duration::from_secs(SERVER_TIME_TTL_SECS) {
                return entry.server_ms + age.as_millis() as i64;
            }
        }

        match self.get(&self.base_url, "/time", &[]).await {
            Ok(v) => {
                if let Some(server_ms) = payload::pick_server_time_ms(&v) {
                    *cache = Some(ServerTimeCache { server_ms, fetched_at: Instant::now() });
                    return server_ms;
                }
                debug!("time endpoint payload had no usable clock field");
            }
            Err(e) => debug!("server time fetch failed, using local clock: {e}"),
        }
        local_now_ms()
    }
}
