//! Canonical event builders.
//!
//! Every producer goes through these so the on-disk schema stays consistent.
//! Builders are pure: no I/O, no globals, output fully determined by input
//! (plus the wall clock for the stamp).

use super::fingerprint::{compute_setup_fingerprint, extract_side};
use super::types::{
    normalize_timeframe, now_ms, ExecutionMode, JsonMap, OutcomeEvent, SetupEvent,
};

/// Build a `setup_context` event: normalizes the timeframe, coerces an empty
/// setup type to `"unknown"`, and stamps the setup fingerprint.
#[allow(clippy::too_many_arguments)]
pub fn build_setup_context(
    trade_id: &str,
    symbol: &str,
    account_label: &str,
    strategy: &str,
    setup_type: Option<&str>,
    timeframe: Option<&str>,
    features: JsonMap,
    extra: JsonMap,
) -> SetupEvent {
    let setup_type = match setup_type.map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => "unknown".to_string(),
    };

    let timeframe = timeframe
        .and_then(normalize_timeframe)
        .or_else(|| {
            extra
                .get("timeframe")
                .and_then(serde_json::Value::as_str)
                .and_then(normalize_timeframe)
        })
        .unwrap_or_else(|| "unknown".to_string());

    let account_label = non_empty_or(account_label, "main");
    let strategy = non_empty_or(strategy, "unknown");

    let side = extract_side(&features);
    let fingerprint = compute_setup_fingerprint(
        symbol,
        &account_label,
        &strategy,
        &setup_type,
        &timeframe,
        side.as_deref(),
        &features,
    );

    SetupEvent {
        ts_ms: now_ms(),
        trade_id: trade_id.to_string(),
        symbol: symbol.to_string(),
        account_label,
        strategy,
        setup_type,
        timeframe,
        setup_fingerprint: Some(fingerprint),
        features,
        extra,
        aborted: false,
    }
}

/// Inputs for [`build_outcome_record`] beyond the identity fields. Defaults
/// describe a zero-pnl, non-classified outcome.
#[derive(Debug, Default)]
pub struct OutcomeParts {
    pub timeframe: Option<String>,
    pub pnl_usd: f64,
    pub r_multiple: Option<f64>,
    pub win: Option<bool>,
    pub exit_reason: Option<String>,
    pub is_terminal: Option<bool>,
    pub final_status: Option<String>,
    pub synthetic: bool,
    pub mode: ExecutionMode,
    pub setup_fingerprint: Option<String>,
    pub extra: JsonMap,
}

/// Build an `outcome_record` event.
pub fn build_outcome_record(
    trade_id: &str,
    symbol: &str,
    account_label: &str,
    strategy: &str,
    parts: OutcomeParts,
) -> OutcomeEvent {
    OutcomeEvent {
        ts_ms: now_ms(),
        trade_id: trade_id.to_string(),
        symbol: symbol.to_string(),
        account_label: non_empty_or(account_label, "main"),
        strategy: non_empty_or(strategy, "unknown"),
        timeframe: parts.timeframe.as_deref().and_then(normalize_timeframe),
        pnl_usd: parts.pnl_usd,
        r_multiple: parts.r_multiple,
        win: parts.win,
        exit_reason: parts.exit_reason,
        is_terminal: parts.is_terminal,
        final_status: parts.final_status,
        synthetic: parts.synthetic,
        mode: parts.mode,
        setup_fingerprint: parts.setup_fingerprint,
        extra: parts.extra,
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn setup_builder_normalizes_and_stamps_fingerprint() {
        let features: JsonMap =
            [("risk_usd".to_string(), json!(12.5)), ("side".to_string(), json!("long"))]
                .into_iter()
                .collect();
        let setup = build_setup_context(
            "T1",
            "BTCUSDT",
            "",
            "trend",
            None,
            Some("15"),
            features,
            JsonMap::new(),
        );

        assert_eq!(setup.account_label, "main");
        assert_eq!(setup.setup_type, "unknown");
        assert_eq!(setup.timeframe, "15m");
        assert!(setup.setup_fingerprint.is_some());
        assert!(setup.ts_ms > 0);
    }

    #[test]
    fn setup_builder_falls_back_to_extra_timeframe() {
        let extra: JsonMap = [("timeframe".to_string(), json!("4h"))].into_iter().collect();
        let setup = build_setup_context(
            "T1",
            "BTCUSDT",
            "main",
            "trend",
            Some("breakout"),
            None,
            JsonMap::new(),
            extra,
        );
        assert_eq!(setup.timeframe, "4h");
    }

    #[test]
    fn same_features_same_fingerprint_across_trades() {
        let feats: JsonMap = [("atr_bucket".to_string(), json!("mid"))].into_iter().collect();
        let a = build_setup_context(
            "T1", "BTCUSDT", "main", "trend", Some("breakout"), Some("5m"),
            feats.clone(), JsonMap::new(),
        );
        let b = build_setup_context(
            "T2", "BTCUSDT", "main", "trend", Some("breakout"), Some("5m"),
            feats, JsonMap::new(),
        );
        assert_eq!(a.setup_fingerprint, b.setup_fingerprint);
    }

    #[test]
    fn outcome_builder_defaults_identity_fallbacks() {
        let evt = build_outcome_record("T1", "BTCUSDT", " ", "", OutcomeParts::default());
        assert_eq!(evt.account_label, "main");
        assert_eq!(evt.strategy, "unknown");
        assert_eq!(evt.pnl_usd, 0.0);
        assert_eq!(evt.r_multiple, None);
        assert!(!evt.synthetic);
    }
}
