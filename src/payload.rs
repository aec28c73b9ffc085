//! Permissive extraction helpers for upstream JSON.
//!
//! The venue's responses are polymorphic: payloads nest under `result` or
//! `data` (or neither), numeric fields arrive as strings, and key names flip
//! between snake and camel case. Everything that touches upstream JSON goes
//! through the pick-first-present-key helpers here.

use serde_json::Value;

use crate::error::{AppError, Result};

/// Millisecond-epoch floor: any timestamp below this is in seconds.
const MS_EPOCH_FLOOR: i64 = 1_000_000_000_000;

/// Coerce a seconds-or-milliseconds epoch into milliseconds.
pub fn ensure_millis(ts: i64) -> i64 {
    if ts > 0 && ts < MS_EPOCH_FLOOR {
        ts * 1000
    } else {
        ts
    }
}

/// Application-level error code from an envelope: first numeric of
/// `errno`/`code`, defaulting to 0 (success).
pub fn envelope_code(v: &Value) -> i64 {
    pick_i64(v, &["errno", "code"]).unwrap_or(0)
}

/// Unwrap an upstream envelope into its payload, walking
/// `result` → `data` permissively. A non-zero `errno`/`code` is an error.
pub fn unwrap_envelope(v: Value) -> Result<Value> {
    let code = envelope_code(&v);
    if code != 0 {
        let message = pick_str(&v, &["msg", "message", "error"])
            .unwrap_or_else(|| "unspecified".to_string());
        return Err(AppError::Upstream { code, message });
    }
    let mut payload = v;
    for key in ["result", "data"] {
        if let Some(inner) = payload.get(key) {
            payload = inner.clone();
        }
    }
    Ok(payload)
}

/// First present key as f64, coercing numeric strings.
pub fn pick_f64(v: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(field) = v.get(key) {
            if let Some(n) = as_f64(field) {
                return Some(n);
            }
        }
    }
    None
}

/// First present key as i64, coercing numeric strings and truncating floats.
pub fn pick_i64(v: &Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        if let Some(field) = v.get(key) {
            if let Some(n) = as_i64(field) {
                return Some(n);
            }
        }
    }
    None
}

/// First present key as a non-empty string; numbers are stringified so ids
/// reported numerically still come through.
pub fn pick_str(v: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match v.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

pub fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

/// Timestamp of an observation: first numeric of `timestamp`/`time`/`ts`,
/// second-resolution values promoted to milliseconds.
pub fn pick_timestamp_ms(v: &Value) -> Option<i64> {
    pick_i64(v, &["timestamp", "time", "ts"]).map(ensure_millis)
}

/// Server clock from the time endpoint, in milliseconds.
pub fn pick_server_time_ms(v: &Value) -> Option<i64> {
    pick_i64(v, &["serverTime", "server_time", "timestamp", "time", "ts"]).map(ensure_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ensure_millis_promotes_seconds() {
        assert_eq!(ensure_millis(1_700_000_000), 1_700_000_000_000);
        assert_eq!(ensure_millis(1_700_000_000_123), 1_700_000_000_123);
        assert_eq!(ensure_millis(0), 0);
        assert_eq!(ensure_millis(-5), -5);
    }

    #[test]
    fn envelope_unwraps_result_then_data() {
        let v = json!({"code": 0, "result": {"data": {"price": "0.42"}}});
        let payload = unwrap_envelope(v).unwrap();
        assert_eq!(pick_f64(&payload, &["price"]), Some(0.42));

        let inline = json!({"errno": 0, "price": 0.9});
        let payload = unwrap_envelope(inline).unwrap();
        assert_eq!(pick_f64(&payload, &["price"]), Some(0.9));
    }

    #[test]
    fn envelope_surfaces_error_codes() {
        let v = json!({"errno": 10200, "msg": "topic not found"});
        let err = unwrap_envelope(v).unwrap_err();
        assert!(err.is_topic_not_found());

        let v = json!({"code": 500, "message": "boom"});
        match unwrap_envelope(v).unwrap_err() {
            AppError::Upstream { code, message } => {
                assert_eq!(code, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn pick_helpers_coerce_strings_and_fall_through() {
        let v = json!({"marketId": "123", "vol": "45.5", "title": "X"});
        assert_eq!(pick_i64(&v, &["id", "marketId"]), Some(123));
        assert_eq!(pick_f64(&v, &["volume", "vol"]), Some(45.5));
        assert_eq!(pick_str(&v, &["name", "title"]), Some("X".to_string()));
        assert_eq!(pick_str(&v, &["marketId"]), Some("123".to_string()));
        assert_eq!(pick_i64(&v, &["missing"]), None);
    }

    #[test]
    fn numeric_ids_stringify() {
        let v = json!({"topicId": 987});
        assert_eq!(pick_str(&v, &["topicId"]), Some("987".to_string()));
    }

    #[test]
    fn observation_timestamps_coerce() {
        assert_eq!(
            pick_timestamp_ms(&json!({"time": 1_700_000_000})),
            Some(1_700_000_000_000)
        );
        assert_eq!(
            pick_timestamp_ms(&json!({"timestamp": 1_700_000_000_500i64})),
            Some(1_700_000_000_500)
        );
        assert_eq!(pick_timestamp_ms(&json!({})), None);
    }
}
