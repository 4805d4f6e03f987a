//! Gating consumer: the decision-consumption contract.
//!
//! Takes a proposed trading action (envelope or flat shape), normalizes and
//! validates it, looks up the fingerprint's performance record, and emits a
//! tiered decision: LOG_ONLY (record it), NOTIFY (tell a human), or
//! EXEC_ELIGIBLE (trusted enough for the execution path). Malformed input is
//! rejected quietly: this sits in front of trading logic and must not throw.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::events::types::{now_ms, value_as_f64};
use crate::perf::gating::{should_allow, Thresholds};
use crate::perf::PerfSnapshot;
use crate::storage::read_json;

const VALID_ACTION_KINDS: &[&str] = &["open", "close", "reduce", "adjust_tp", "adjust_sl"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateTier {
    LogOnly,
    Notify,
    ExecEligible,
}

/// Canonical shape every proposed action normalizes to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedAction {
    pub kind: String,
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub account_label: String,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatingDecision {
    pub tier: GateTier,
    pub confidence: f64,
    pub reason: String,
    pub action: ProposedAction,
    pub ts_ms: i64,
}

pub struct GatingConsumer {
    account_label: String,
    thresholds: Thresholds,
    snapshot_path: PathBuf,
}

impl GatingConsumer {
    pub fn new(cfg: &PipelineConfig) -> Self {
        let mut thresholds = Thresholds::default();
        cfg.apply_threshold_overrides(&mut thresholds);
        Self {
            account_label: cfg.account_label.clone(),
            thresholds,
            snapshot_path: cfg.perf_snapshot_path(),
        }
    }

    /// Normalize a raw proposed action. Accepts the envelope shape
    /// (`{"label": ..., "action": {...}}`, label must match this consumer)
    /// and the flat shape (fields at top level). Malformed input yields `None`.
    pub fn normalize(&self, raw: &Value) -> Option<ProposedAction> {
        let obj = raw.as_object()?;

        let (action, label, ts_ms) = if let Some(inner) = obj.get("action") {
            // Envelope shape: label is mandatory and must be ours.
            let label = obj.get("label").and_then(Value::as_str)?.to_string();
            if label != self.account_label {
                debug!(label = %label, "dropping action addressed to another consumer");
                return None;
            }
            let ts = obj.get("ts_ms").and_then(Value::as_i64).unwrap_or_else(now_ms);
            (inner.as_object()?, label, ts)
        } else {
            let ts = obj.get("ts_ms").and_then(Value::as_i64).unwrap_or_else(now_ms);
            let label = obj
                .get("account_label")
                .and_then(Value::as_str)
                .unwrap_or(&self.account_label)
                .to_string();
            (obj, label, ts)
        };

        let kind = match action.get("type").and_then(Value::as_str) {
            Some(t) => {
                let t = t.trim().to_ascii_lowercase();
                if !VALID_ACTION_KINDS.contains(&t.as_str()) {
                    debug!(kind = %t, "unsupported action type");
                    return None;
                }
                t
            }
            None => "open".to_string(),
        };

        let symbol = action
            .get("symbol")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())?
            .to_ascii_uppercase();

        let side = match action.get("side") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let s = v.as_str()?.trim().to_ascii_lowercase();
                match s.as_str() {
                    "buy" | "long" => Some("buy".to_string()),
                    "sell" | "short" => Some("sell".to_string()),
                    _ => return None,
                }
            }
        };

        let qty = match action.get("qty") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let q = value_as_f64(v)?;
                if !q.is_finite() || q < 0.0 {
                    return None;
                }
                Some(q)
            }
        };

        let confidence = action
            .get("confidence")
            .and_then(value_as_f64)
            .map(|c| c.clamp(0.0, 1.0));

        let fingerprint = action
            .get("fingerprint")
            .or_else(|| action.get("setup_fingerprint"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Some(ProposedAction {
            kind,
            symbol,
            side,
            qty,
            confidence,
            fingerprint,
            account_label: label,
            ts_ms,
        })
    }

    /// Normalize and tier a raw action. `None` only for malformed input; any
    /// well-formed action always gets a decision (worst case LOG_ONLY).
    pub fn decide(&self, raw: &Value) -> Option<GatingDecision> {
        let action = self.normalize(raw)?;
        Some(self.decide_action(action))
    }

    pub fn decide_action(&self, action: ProposedAction) -> GatingDecision {
        let snapshot = match read_json::<PerfSnapshot>(&self.snapshot_path) {
            Ok(Some(snap)) => Some(snap),
            Ok(None) => None,
            Err(e) => {
                warn!(path = %self.snapshot_path.display(), "snapshot unreadable: {e}");
                None
            }
        };

        let Some(snapshot) = snapshot else {
            // Degraded mode: no statistics at all, trust only what the action
            // claims about itself.
            let conf = action.confidence.unwrap_or(0.0);
            return self.tiered(
                action,
                conf,
                format!("performance store unavailable; self-reported confidence {conf:.2}"),
            );
        };

        let Some(fingerprint) = action.fingerprint.clone() else {
            return self.log_only(action, 0.0, "no fingerprint on action".to_string());
        };

        let Some(record) = snapshot.fingerprints.get(&fingerprint) else {
            let short: String = fingerprint.chars().take(12).collect();
            return self.log_only(action, 0.0, format!("no statistics for fingerprint {short}"));
        };

        let verdict = should_allow(record, &self.thresholds);
        if !verdict.allow {
            return self.log_only(action, verdict.confidence, verdict.reason);
        }
        self.tiered(action, verdict.confidence, verdict.reason)
    }

    fn tiered(&self, action: ProposedAction, confidence: f64, reason: String) -> GatingDecision {
        let tier = if confidence >= self.thresholds.confidence_execute {
            GateTier::ExecEligible
        } else if confidence >= self.thresholds.confidence_notify {
            GateTier::Notify
        } else {
            GateTier::LogOnly
        };
        GatingDecision { tier, confidence, reason, action, ts_ms: now_ms() }
    }

    fn log_only(&self, action: ProposedAction, confidence: f64, reason: String) -> GatingDecision {
        GatingDecision { tier: GateTier::LogOnly, confidence, reason, action, ts_ms: now_ms() }
    }
}
