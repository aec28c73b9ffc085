use async_trait::async_trait;
use tracing::info;

use crate::error::{AppError, Result};
use crate::types::{Detection, MarketStream, Tick};

/// Alert delivery seam. The detector only learns success or failure; on
/// failure it leaves cooldown state untouched so the next opportunity can
/// still fire.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, market: &MarketStream, tick: &Tick, detection: &Detection)
        -> Result<()>;
}

/// Log-only delivery, used when no Telegram credentials are configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        market: &MarketStream,
        tick: &Tick,
        detection: &Detection,
    ) -> Result<()> {
        info!(
            market_id = market.market_id,
            title = %market.title,
            price = tick.yes_price,
            prev_price = detection.prev_price,
            price_z = format_args!("{:.2}", detection.price_z),
            volume_z = format_args!("{:.2}", detection.volume_z),
            score = format_args!("{:.2}", detection.adjusted_score),
            "ALERT | {} | {:.3} -> {:.3} | score {:.2}",
            market.title, detection.prev_price, tick.yes_price, detection.adjusted_score,
        );
        Ok(())
    }
}

/// Telegram Bot API delivery (`sendMessage`, HTML parse mode).
pub struct TelegramNotifier {
    http: reqwest::Client,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(token: String, chat_id: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()?;
        Ok(Self { http, token, chat_id })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(
        &self,
        market: &MarketStream,
        tick: &Tick,
        detection: &Detection,
    ) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": render_alert(market, tick, detection),
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        let resp = self.http.post(&url).json(&body).send().await?;
        let status = resp.status();
        let reply: serde_json::Value = resp.json().await?;
        if !status.is_success() || reply.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            let desc = reply
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("no description");
            return Err(AppError::Notify(format!("telegram sendMessage failed ({status}): {desc}")));
        }
        Ok(())
    }
}

/// Alert text in Telegram HTML. The title is the only free-form field and is
/// escaped; everything else is formatted numerics.
pub fn render_alert(market: &MarketStream, tick: &Tick, detection: &Detection) -> String {
    let direction = if detection.price_change >= 0.0 { "▲" } else { "▼" };
    format!(
        "<b>{title}</b>\n\
         {direction} {prev:.3} → {now:.3}  (Δ {change:+.3}, gate {gate:.2})\n\
         z price {pz:.2} · z volume {vz:.2} · score <b>{score:.2}</b>\n\
         volume {volume:.0} (+{delta:.0})",
        title = escape_html(&market.title),
        prev = detection.prev_price,
        now = tick.yes_price,
        change = detection.price_change,
        gate = detection.adaptive_threshold,
        pz = detection.price_z,
        vz = detection.volume_z,
        score = detection.adjusted_score,
        volume = tick.volume,
        delta = tick.delta_volume,
    )
}

/// Minimal HTML escaping for Telegram's HTML parse mode.
pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures() -> (MarketStream, Tick, Detection) {
        let market = MarketStream {
            market_id: 9,
            yes_token_id: "tok".to_string(),
            title: "Will A <beat> B & C?".to_string(),
            parent_market_id: None,
            topic_id: "9".to_string(),
            market_type: Some(0),
            chain_id: Some(56),
            cutoff_at: None,
            updated_at: 0,
        };
        let tick = Tick { market_id: 9, ts: 0, yes_price: 0.70, volume: 5200.0, delta_volume: 200.0 };
        let detection = Detection {
            price_z: 39.8,
            volume_z: 9.7,
            adjusted_score: 126.4,
            price_change: 0.19,
            prev_price: 0.51,
            adaptive_threshold: 0.15,
        };
        (market, tick, detection)
    }

    #[test]
    fn escape_handles_markup_characters() {
        assert_eq!(escape_html("a & <b>"), "a &amp; &lt;b&gt;");
        assert_eq!(escape_html("plain"), "plain");
    }

    #[test]
    fn alert_text_escapes_title_and_formats_numbers() {
        let (market, tick, detection) = fixtures();
        let text = render_alert(&market, &tick, &detection);
        assert!(text.contains("Will A &lt;beat&gt; B &amp; C?"));
        assert!(text.contains("0.510 → 0.700"));
        assert!(text.contains("Δ +0.190"));
        assert!(text.contains("score <b>126.40</b>"));
        assert!(text.contains("volume 5200 (+200)"));
    }
}
