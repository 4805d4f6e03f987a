//! Raw execution-row handling: wrapper unwrapping, field coercion, exec-id
//! derivation, timestamp normalization, per-fill cashflow, and the bounded
//! dedupe window.
//!
//! Exchange rows arrive in several shapes depending on which hop wrapped
//! them; everything funnels into one flat row type here.

use std::collections::{HashSet, VecDeque};

use serde_json::Value;

use crate::events::fingerprint::content_hash;
use crate::events::types::{now_ms, value_as_f64, JsonMap};

/// Unwrap an execution message into flat rows.
///
/// Accepted shapes:
/// 1. `{"data": {...}}` / `{"data": [...]}` (switchboard wrapper)
/// 2. `{"topic": "execution", "result": {"data": ...}}` (direct push)
/// 3. already-flat row (`symbol` plus an exec field)
///
/// A wrapper-level `account_label` back-fills rows that lack one.
pub fn extract_rows(msg: &Value) -> Vec<JsonMap> {
    let Some(obj) = msg.as_object() else {
        return Vec::new();
    };

    let wrapper_label = obj
        .get("account_label")
        .or_else(|| obj.get("label"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut rows = Vec::new();
    let mut push = |row: &JsonMap| {
        let mut row = row.clone();
        if let Some(label) = &wrapper_label {
            row.entry("account_label".to_string())
                .or_insert_with(|| Value::String(label.clone()));
        }
        rows.push(row);
    };

    if let Some(data) = obj.get("data") {
        collect_data(data, &mut push);
        return rows;
    }

    if obj.get("topic").and_then(Value::as_str) == Some("execution") {
        if let Some(data) = obj.get("result").and_then(Value::as_object).and_then(|r| r.get("data"))
        {
            collect_data(data, &mut push);
            return rows;
        }
    }

    let looks_flat = obj.contains_key("symbol")
        && (obj.contains_key("execPrice")
            || obj.contains_key("execQty")
            || obj.contains_key("execValue"));
    if looks_flat {
        push(obj);
    }

    rows
}

fn collect_data(data: &Value, push: &mut impl FnMut(&JsonMap)) {
    match data {
        Value::Object(row) => push(row),
        Value::Array(items) => {
            for item in items {
                if let Some(row) = item.as_object() {
                    push(row);
                }
            }
        }
        _ => {}
    }
}

/// First non-empty string among the candidate keys.
pub fn str_field<'a>(row: &'a JsonMap, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| {
        row.get(*k)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    })
}

/// First parseable number among the candidate keys (accepts string-encoded
/// numbers, which most exchange payloads use).
pub fn num_field(row: &JsonMap, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| row.get(*k).and_then(value_as_f64))
}

/// Trade id for a row: order link id, then order id, then a synthetic id so
/// the row is at least traceable.
pub fn trade_id_from_row(row: &JsonMap) -> String {
    str_field(row, &["orderLinkId", "order_link_id", "orderId", "order_id"])
        .map(str::to_string)
        .unwrap_or_else(|| {
            let sym = str_field(row, &["symbol"]).unwrap_or("UNKNOWN");
            format!("exec_{}_{}", sym, now_ms())
        })
}

/// Execution identity for dedupe, in preference order: a true exec id, a
/// composite of order/ts/symbol/price/qty/side, then a content hash of the
/// whole row.
pub fn exec_id_from_row(row: &JsonMap) -> String {
    if let Some(id) =
        str_field(row, &["execId", "exec_id", "executionId", "execution_id", "id"])
    {
        return id.to_string();
    }

    let order_id = str_field(row, &["orderId", "order_id"]).unwrap_or("");
    let ts = raw_field_string(row, &["execTime", "exec_time", "T", "ts"]);
    let sym = str_field(row, &["symbol"]).unwrap_or("");
    let px = raw_field_string(row, &["execPrice", "price"]);
    let qty = raw_field_string(row, &["execQty", "qty"]);
    let side = str_field(row, &["side"]).unwrap_or("");

    if !order_id.is_empty() || !ts.is_empty() || !sym.is_empty() {
        return format!("fallback:{order_id}:{ts}:{sym}:{px}:{qty}:{side}");
    }

    format!("hash:{}", content_hash(&Value::Object(row.clone())))
}

fn raw_field_string(row: &JsonMap, keys: &[&str]) -> String {
    for k in keys {
        match row.get(*k) {
            Some(Value::String(s)) if !s.trim().is_empty() => return s.trim().to_string(),
            Some(Value::Number(n)) => return n.to_string(),
            _ => {}
        }
    }
    String::new()
}

/// Normalize an epoch timestamp to milliseconds: 10-digit values are seconds,
/// 13-digit values already milliseconds. Unparseable input gets the wall
/// clock.
pub fn normalize_ts_ms(raw: Option<&Value>) -> i64 {
    let parsed = raw.and_then(|v| match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    });
    match parsed {
        Some(v) if v > 0 && v < 10_000_000_000 => v * 1000,
        Some(v) if v > 0 => v,
        _ => now_ms(),
    }
}

/// Exchange-reported realized PnL, when present.
pub fn realized_pnl(row: &JsonMap) -> Option<f64> {
    num_field(
        row,
        &["closedPnl", "closed_pnl", "execPnl", "exec_pnl", "realizedPnl", "realized_pnl", "pnl"],
    )
    .filter(|v| v.is_finite())
}

/// Per-fill cashflow approximation in quote currency: a buy is cash out
/// `-(value + fee)`, a sell is cash in `value - fee`. Not trade PnL.
pub fn fill_cashflow(side: &str, price: f64, qty: f64, value: f64, fee: f64) -> f64 {
    let value = if value <= 0.0 && price > 0.0 && qty > 0.0 { price * qty } else { value };
    match side.trim().to_ascii_lowercase().as_str() {
        "buy" => -(value + fee),
        "sell" => value - fee,
        _ => 0.0,
    }
}

/// Bounded FIFO set: remembers the last `cap` execution ids seen by this
/// process. Re-read log bytes after a crash re-enter here and drop out.
pub struct DedupeWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl DedupeWindow {
    pub fn new(cap: usize) -> Self {
        Self { seen: HashSet::with_capacity(cap), order: VecDeque::with_capacity(cap), cap }
    }

    /// Returns true when the id is new (process it), false on a duplicate.
    pub fn insert(&mut self, id: &str) -> bool {
        if id.is_empty() || self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
