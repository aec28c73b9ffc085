use regex::RegexBuilder;

use crate::error::{AppError, Result};

pub const UPSTREAM_API_URL: &str = "https://api.example-venue.io/v1";
pub const UPSTREAM_PRIVATE_API_URL: &str = "https://api.example-venue.io/private";

/// EWMA smoothing span; alpha = 2 / (span + 1).
pub const EWMA_SPAN: f64 = 20.0;

/// Ticks the estimator must consume before detection decisions begin.
pub const MIN_TICKS_FOR_DETECTION: i64 = 20;

/// Standard-deviation noise floors for the Z-score denominators.
pub const MIN_STD_PRICE: f64 = 0.005;
pub const MIN_STD_VOLUME: f64 = 20.0;

/// Per-market alert cooldown and duplicate-hash suppression windows (ms).
pub const ALERT_COOLDOWN_MS: i64 = 6 * 3600 * 1000;
pub const DUPLICATE_ALERT_WINDOW_MS: i64 = 6 * 3600 * 1000;

/// Per-market retention: raw ticks feed deltas and charts, filtered ticks
/// seed the estimator's cold start.
pub const RAW_TICK_RETENTION: i64 = 400;
pub const FILTERED_TICK_RETENTION: i64 = 120;

/// Markets fetched concurrently per poll batch.
pub const COLLECT_BATCH_SIZE: usize = 60;

/// Upstream request gate: token bucket reservoir/refill per second, max
/// in-flight requests, and minimum spacing between request starts.
pub const RATE_LIMIT_PER_SEC: u32 = 12;
pub const MAX_CONCURRENT_REQUESTS: usize = 6;
pub const MIN_REQUEST_SPACING_MS: u64 = 85;

/// Single retry backoff for connect timeouts and 5xx responses.
pub const RETRY_BACKOFF_MS: u64 = 300;

/// Upstream request timeout (seconds).
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// How long a fetched server-time offset stays fresh (seconds).
pub const SERVER_TIME_TTL_SECS: u64 = 30;

/// Scheduler cadences.
pub const CATALOG_REFRESH_INTERVAL_SECS: u64 = 3600;
pub const TICK_POLL_INTERVAL_SECS: u64 = 60;
pub const HEARTBEAT_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct Config {
    pub upstream_api_url: String,
    pub upstream_private_api_url: String,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Acceptance gate: a tick is filtered out when BOTH its cumulative
    /// volume and its delta are below these floors.
    pub min_total_volume: f64,
    pub min_delta_volume: f64,
    /// Adjusted score needed to trigger (Z_THRESHOLD).
    pub z_threshold: f64,
    /// Zone-adaptive |Δ| gate on/off (USE_ADAPTIVE_THRESHOLDS).
    pub use_adaptive_thresholds: bool,
    /// Minimum |Δ| per price zone, and the single fallback used when the
    /// adaptive gate is disabled.
    pub deep_extreme_min_change: f64,
    pub near_extreme_min_change: f64,
    pub middle_min_change: f64,
    pub min_abs_price_change: f64,
    /// β in `1 + max(0, z_vol - 1) * β`.
    pub volume_boost_factor: f64,
    /// Catalog walk: page size, concurrent page fetches, and per-endpoint
    /// consecutive not-found stops.
    pub page_size: u32,
    pub page_workers: usize,
    pub detail_not_found_stop: u32,
    pub multi_not_found_stop: u32,
    /// Case-insensitive substrings that suppress alerts by title
    /// (ALERT_TITLE_BLOCKLIST, comma-separated).
    pub alert_title_blocklist: Vec<String>,
    /// Optional single case-insensitive regex over titles
    /// (ALERT_TITLE_BLOCKLIST_REGEX).
    pub alert_title_blocklist_regex: Option<regex::Regex>,
    /// Minute-of-hour ranges during which tick polls are suppressed
    /// (BLACKOUT_WINDOWS, e.g. "56-59,26-32"). Inclusive on both ends.
    pub blackout_windows: Vec<(u32, u32)>,
    /// Telegram credentials; when both are set the Telegram notifier is
    /// used, otherwise alerts go to the log.
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let blocklist_regex = match std::env::var("ALERT_TITLE_BLOCKLIST_REGEX") {
            Ok(pat) if !pat.trim().is_empty() => Some(
                RegexBuilder::new(pat.trim())
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        AppError::Config(format!("ALERT_TITLE_BLOCKLIST_REGEX invalid: {e}"))
                    })?,
            ),
            _ => None,
        };

        Ok(Self {
            upstream_api_url: std::env::var("UPSTREAM_API_URL")
                .unwrap_or_else(|_| UPSTREAM_API_URL.to_string()),
            upstream_private_api_url: std::env::var("UPSTREAM_PRIVATE_API_URL")
                .unwrap_or_else(|_| UPSTREAM_PRIVATE_API_URL.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "pulse.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            min_total_volume: env_f64("MIN_TOTAL_VOLUME", 3000.0),
            min_delta_volume: env_f64("MIN_DELTA_VOLUME", 80.0),
            z_threshold: env_f64("Z_THRESHOLD", 2.5),
            use_adaptive_thresholds: std::env::var("USE_ADAPTIVE_THRESHOLDS")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            deep_extreme_min_change: env_f64("DEEP_EXTREME_MIN_CHANGE", 0.07),
            near_extreme_min_change: env_f64("NEAR_EXTREME_MIN_CHANGE", 0.10),
            middle_min_change: env_f64("MIDDLE_MIN_CHANGE", 0.15),
            min_abs_price_change: env_f64("MIN_ABS_PRICE_CHANGE", 0.03),
            volume_boost_factor: env_f64("VOLUME_BOOST_FACTOR", 0.25),
            page_size: std::env::var("PAGE_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .unwrap_or(100),
            page_workers: std::env::var("PAGE_WORKERS")
                .unwrap_or_else(|_| "16".to_string())
                .parse()
                .unwrap_or(16),
            detail_not_found_stop: std::env::var("DETAIL_NOT_FOUND_STOP")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),
            multi_not_found_stop: std::env::var("MULTI_NOT_FOUND_STOP")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),
            alert_title_blocklist: std::env::var("ALERT_TITLE_BLOCKLIST")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            alert_title_blocklist_regex: blocklist_regex,
            blackout_windows: parse_blackout_windows(
                &std::env::var("BLACKOUT_WINDOWS").unwrap_or_else(|_| "56-59,26-32".to_string()),
            ),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok().filter(|s| !s.is_empty()),
            telegram_chat_id: std::env::var("TELEGRAM_CHAT_ID").ok().filter(|s| !s.is_empty()),
        })
    }

    /// True when the given minute-of-hour falls inside a blackout window.
    pub fn in_blackout(&self, minute: u32) -> bool {
        self.blackout_windows.iter().any(|&(lo, hi)| minute >= lo && minute <= hi)
    }
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse "56-59,26-32" into inclusive ranges. Malformed entries are dropped.
fn parse_blackout_windows(raw: &str) -> Vec<(u32, u32)> {
    raw.split(',')
        .filter_map(|part| {
            let part = part.trim();
            let (lo, hi) = part.split_once('-')?;
            let lo: u32 = lo.trim().parse().ok()?;
            let hi: u32 = hi.trim().parse().ok()?;
            (lo <= hi && hi < 60).then_some((lo, hi))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn blackout_parsing_and_membership() {
        let windows = parse_blackout_windows("56-59,26-32");
        assert_eq!(windows, vec![(56, 59), (26, 32)]);

        let cfg = Config {
            blackout_windows: windows,
            ..test_config()
        };
        assert!(cfg.in_blackout(56));
        assert!(cfg.in_blackout(59));
        assert!(cfg.in_blackout(26));
        assert!(cfg.in_blackout(32));
        assert!(!cfg.in_blackout(33));
        assert!(!cfg.in_blackout(0));
        assert!(!cfg.in_blackout(55));
    }

    #[test]
    fn malformed_blackout_entries_are_dropped() {
        assert_eq!(parse_blackout_windows("56-59,nope,10-70,4-2"), vec![(56, 59)]);
        assert!(parse_blackout_windows("").is_empty());
    }

    pub(crate) fn test_config() -> Config {
        Config {
            upstream_api_url: "http://localhost".to_string(),
            upstream_private_api_url: "http://localhost".to_string(),
            log_level: "info".to_string(),
            db_path: ":memory:".to_string(),
            api_port: 0,
            min_total_volume: 3000.0,
            min_delta_volume: 80.0,
            z_threshold: 2.5,
            use_adaptive_thresholds: true,
            deep_extreme_min_change: 0.07,
            near_extreme_min_change: 0.10,
            middle_min_change: 0.15,
            min_abs_price_change: 0.03,
            volume_boost_factor: 0.25,
            page_size: 100,
            page_workers: 16,
            detail_not_found_stop: 5,
            multi_not_found_stop: 5,
            alert_title_blocklist: Vec::new(),
            alert_title_blocklist_regex: None,
            blackout_windows: Vec::new(),
            telegram_bot_token: None,
            telegram_chat_id: None,
        }
    }
}
