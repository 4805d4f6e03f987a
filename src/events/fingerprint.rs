//! Setup fingerprinting.
//!
//! A fingerprint identifies a *class* of setup (same strategy conditions),
//! never an individual trade, so statistics can aggregate across trades.
//! Per-trade fields (ids, timestamps, prices, sizing) are scrubbed from the
//! feature tree before hashing; otherwise every trade would hash uniquely and
//! no fingerprint would ever accumulate a sample.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::types::JsonMap;

/// Exact keys dropped anywhere in the feature tree.
const DROP_KEYS: &[&str] = &[
    // identity
    "trade_id",
    "client_trade_id",
    "source_trade_id",
    "order_id",
    "orderid",
    "orderlinkid",
    "sub_uid",
    "uid",
    // time
    "ts",
    "ts_ms",
    "ts_open_ms",
    "timestamp",
    "updated_ms",
    "time",
    // sizing / account state
    "qty",
    "size",
    "equity_usd",
    "risk_usd",
    "risk_pct",
    // price-derived, changes every tick
    "price",
    "last",
    "mark",
    "index",
    "best_bid",
    "best_ask",
    "stop_price",
    "take_profit_price",
    "open",
    "high",
    "low",
    "close",
    "last_close",
    "ohlc",
    "ohlcv",
    "hlc3",
    // already part of the fingerprint core
    "symbol",
    "account_label",
    "strategy",
    "strategy_name",
    "timeframe",
    "setup_type",
    "setup_fingerprint",
    "side",
];

const MAX_DEPTH: usize = 12;

fn key_is_volatile(key: &str) -> bool {
    let k = key.trim().to_ascii_lowercase();
    if DROP_KEYS.contains(&k.as_str()) {
        return true;
    }
    // Suffix rule catches prev_close, session_open, week_high, day_low, ...
    if k.ends_with("_close") || k.ends_with("_open") || k.ends_with("_high") || k.ends_with("_low")
    {
        return true;
    }
    // Id-ish keys in varying naming styles (orderId, clientOrderId,
    // source_trade_id). Only obviously id-shaped names are dropped; keys like
    // "trend_dir" or "grid" survive.
    let idish_substring = ["order", "client", "source", "uuid", "guid"]
        .iter()
        .any(|sub| k.contains(sub));
    if idish_substring {
        let idish_shape = k.starts_with("order")
            || k.starts_with("client")
            || k.starts_with("source")
            || k.ends_with("id")
            || k.ends_with("uid");
        if idish_shape {
            return true;
        }
    }
    false
}

fn scrub_value(value: &Value, depth: usize) -> Value {
    if depth > MAX_DEPTH {
        return Value::Null;
    }
    match value {
        Value::Object(map) => {
            let mut out = JsonMap::new();
            for (k, v) in map {
                if key_is_volatile(k) {
                    continue;
                }
                out.insert(k.clone(), scrub_value(v, depth + 1));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| scrub_value(v, depth + 1)).collect())
        }
        other => other.clone(),
    }
}

/// Strip volatile fields from a feature map, keeping structure.
pub fn scrub_features(features: &JsonMap) -> JsonMap {
    match scrub_value(&Value::Object(features.clone()), 0) {
        Value::Object(map) => map,
        _ => JsonMap::new(),
    }
}

/// Recover the trade side from the feature map so long and short setups never
/// collide on one fingerprint.
pub fn extract_side(features: &JsonMap) -> Option<String> {
    let raw = features
        .get("side")
        .and_then(Value::as_str)
        .or_else(|| {
            features
                .get("signal")
                .and_then(Value::as_object)
                .and_then(|sig| sig.get("side"))
                .and_then(Value::as_str)
        })?
        .trim()
        .to_ascii_lowercase();
    if raw.is_empty() {
        return None;
    }
    Some(match raw.as_str() {
        "buy" | "long" => "buy".to_string(),
        "sell" | "short" => "sell".to_string(),
        other => other.to_string(),
    })
}

/// SHA-256 over the stable JSON of the identity core + scrubbed features.
/// `serde_json` maps are key-sorted, so serialization is deterministic.
pub fn compute_setup_fingerprint(
    symbol: &str,
    account_label: &str,
    strategy: &str,
    setup_type: &str,
    timeframe: &str,
    side: Option<&str>,
    features: &JsonMap,
) -> String {
    let core = serde_json::json!({
        "symbol": symbol.to_ascii_uppercase(),
        "account_label": account_label,
        "strategy": strategy,
        "setup_type": setup_type,
        "timeframe": timeframe,
        "side": side,
        "features": Value::Object(scrub_features(features)),
    });
    let encoded = serde_json::to_vec(&core).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    hex::encode(hasher.finalize())
}

/// Deterministic content hash of an arbitrary JSON row; last-resort identity
/// for rows that carry no usable id fields.
pub fn content_hash(value: &Value) -> String {
    let encoded = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    hex::encode(hasher.finalize())
}
