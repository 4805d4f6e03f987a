//! Canonical event shapes for the trade lifecycle.
//!
//! Events travel as one JSON object per line, discriminated by `event_type`.
//! Parsing is strict at this boundary: a line that does not match one of the
//! tagged shapes is rejected by serde instead of silently half-matching.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type JsonMap = serde_json::Map<String, Value>;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Every event kind that can appear on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum Event {
    SetupContext(SetupEvent),
    OutcomeRecord(OutcomeEvent),
    OutcomeEnriched(EnrichedOutcome),
}

impl Event {
    pub fn trade_id(&self) -> &str {
        match self {
            Event::SetupContext(e) => &e.trade_id,
            Event::OutcomeRecord(e) => &e.trade_id,
            Event::OutcomeEnriched(e) => &e.trade_id,
        }
    }

    pub fn ts_ms(&self) -> i64 {
        match self {
            Event::SetupContext(e) => e.ts_ms,
            Event::OutcomeRecord(e) => e.ts_ms,
            Event::OutcomeEnriched(e) => e.ts_ms,
        }
    }

    /// Stamp a timestamp when the producer left it unset.
    pub fn ensure_ts(&mut self) {
        let now = now_ms();
        let ts = match self {
            Event::SetupContext(e) => &mut e.ts_ms,
            Event::OutcomeRecord(e) => &mut e.ts_ms,
            Event::OutcomeEnriched(e) => &mut e.ts_ms,
        };
        if *ts <= 0 {
            *ts = now;
        }
    }
}

/// Context captured when a strategy proposes an entry. Lives in the pending
/// registry until its terminal outcome arrives or the reconciler expires it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupEvent {
    #[serde(default)]
    pub ts_ms: i64,
    pub trade_id: String,
    pub symbol: String,
    pub account_label: String,
    pub strategy: String,
    #[serde(default = "unknown_string")]
    pub setup_type: String,
    #[serde(default = "unknown_string")]
    pub timeframe: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_fingerprint: Option<String>,
    /// Arbitrary strategy features; includes `risk_usd` when known.
    #[serde(default)]
    pub features: JsonMap,
    #[serde(default)]
    pub extra: JsonMap,
    /// Set by abort paths; the reconciler turns this into a terminal outcome.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub aborted: bool,
}

fn unknown_string() -> String {
    "unknown".to_string()
}

impl SetupEvent {
    /// Capital risked at entry, when the strategy recorded it.
    pub fn risk_usd(&self) -> Option<f64> {
        self.features.get("risk_usd").and_then(value_as_f64).filter(|v| v.is_finite())
    }

    /// Aborted either via the top-level flag or any of the legacy extra keys.
    pub fn is_aborted(&self) -> bool {
        if self.aborted {
            return true;
        }
        for key in ["aborted", "is_aborted", "abort", "cancelled", "canceled"] {
            match self.extra.get(key) {
                Some(Value::Bool(true)) => return true,
                Some(Value::String(s)) => {
                    let s = s.trim().to_ascii_lowercase();
                    if matches!(s.as_str(), "true" | "1" | "yes" | "aborted") {
                        return true;
                    }
                }
                _ => {}
            }
        }
        matches!(
            self.extra.get("status").and_then(Value::as_str),
            Some(s) if s.trim().eq_ignore_ascii_case("ABORTED")
        )
    }
}

pub fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Execution mode of the account that produced an outcome. Drives how much a
/// result is trusted when folded into statistics: simulated fills must not
/// dominate gates on real capital.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Paper,
    #[serde(alias = "CANARY")]
    LiveCanary,
    #[default]
    #[serde(alias = "LIVE", alias = "FULL")]
    LiveFull,
}

impl ExecutionMode {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PAPER" => ExecutionMode::Paper,
            "LIVE_CANARY" | "CANARY" => ExecutionMode::LiveCanary,
            _ => ExecutionMode::LiveFull,
        }
    }

    /// Clamp bound and learn-weight for this mode.
    pub fn normalization(self) -> (f64, f64) {
        match self {
            ExecutionMode::Paper => (2.0, 0.05),
            ExecutionMode::LiveCanary => (5.0, 0.50),
            ExecutionMode::LiveFull => (10.0, 1.00),
        }
    }

    /// Clamp a raw risk multiple into this mode's trusted range and pair it
    /// with the mode's learn-weight.
    pub fn normalize_r(self, raw_r: f64) -> (f64, f64) {
        let (bound, weight) = self.normalization();
        (raw_r.clamp(-bound, bound), weight)
    }
}

/// A fill or terminal result reported for one trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeEvent {
    #[serde(default)]
    pub ts_ms: i64,
    pub trade_id: String,
    pub symbol: String,
    pub account_label: String,
    pub strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
    #[serde(default)]
    pub pnl_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r_multiple: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub win: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<String>,
    /// Explicit terminality. `None` for legacy producers that only set
    /// `final_status`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_terminal: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_status: Option<String>,
    /// Reconciler-made terminal (not exchange truth).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synthetic: bool,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_fingerprint: Option<String>,
    #[serde(default)]
    pub extra: JsonMap,
}

impl OutcomeEvent {
    /// Terminality with the legacy string-status fallback: the explicit flag
    /// wins; otherwise `final_status` decides; otherwise unknown.
    pub fn terminal_flag(&self) -> Option<bool> {
        if let Some(flag) = self.is_terminal {
            return Some(flag);
        }
        match self.final_status.as_deref().map(str::trim) {
            Some(s) if s.eq_ignore_ascii_case("FILL_EVENT") => Some(false),
            Some(s)
                if s.eq_ignore_ascii_case("CLOSED")
                    || s.eq_ignore_ascii_case("ABORTED")
                    || s.eq_ignore_ascii_case("EXPIRED") =>
            {
                Some(true)
            }
            _ => None,
        }
    }
}

/// Computed join of one setup with its terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeStats {
    pub pnl_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r_multiple: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub win: Option<bool>,
    pub is_terminal: bool,
}

/// Product of merging exactly one setup with its terminal outcome. Embeds
/// both originals so downstream consumers never re-join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedOutcome {
    #[serde(default)]
    pub ts_ms: i64,
    pub trade_id: String,
    pub symbol: String,
    pub account_label: String,
    pub strategy: String,
    pub setup_type: String,
    pub timeframe: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_fingerprint: Option<String>,
    pub final_status: String,
    pub setup: SetupEvent,
    pub outcome: OutcomeEvent,
    pub stats: MergeStats,
}

/// Merge a setup with its terminal outcome.
///
/// `r_multiple = pnl / risk_usd` when the setup recorded a nonzero risk
/// basis, absent otherwise; `win` follows the r-multiple's sign.
pub fn merge_setup_and_outcome(setup: &SetupEvent, outcome: &OutcomeEvent) -> EnrichedOutcome {
    let pnl_usd = outcome.pnl_usd;
    let r_multiple = setup
        .risk_usd()
        .filter(|risk| *risk != 0.0)
        .map(|risk| pnl_usd / risk)
        .filter(|r| r.is_finite());
    let win = r_multiple.map(|r| r > 0.0);

    EnrichedOutcome {
        ts_ms: now_ms(),
        trade_id: setup.trade_id.clone(),
        symbol: setup.symbol.clone(),
        account_label: setup.account_label.clone(),
        strategy: setup.strategy.clone(),
        setup_type: setup.setup_type.clone(),
        timeframe: setup.timeframe.clone(),
        setup_fingerprint: setup.setup_fingerprint.clone(),
        final_status: "CLOSED".to_string(),
        setup: setup.clone(),
        outcome: outcome.clone(),
        stats: MergeStats { pnl_usd, r_multiple, win, is_terminal: true },
    }
}

/// Normalize a timeframe label: lowercase unit-suffixed strings pass through,
/// bare integers become minutes, anything else is `None`.
pub fn normalize_timeframe(raw: &str) -> Option<String> {
    let s = raw.trim().to_ascii_lowercase();
    if s.is_empty() {
        return None;
    }
    if s.ends_with(&['m', 'h', 'd', 'w'][..]) {
        return Some(s);
    }
    match s.parse::<f64>() {
        Ok(n) if n > 0.0 => Some(format!("{}m", n as i64)),
        _ => None,
    }
}
