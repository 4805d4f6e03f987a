//! Gating: maps a fingerprint's accumulated statistics to a trust status and
//! a confidence score in [0, 1].

use serde::{Deserialize, Serialize};

use crate::events::types::now_ms;

use super::stats::FingerprintStats;

/// Trust tier for a setup fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateStatus {
    #[default]
    Unproven,
    Probation,
    Approved,
}

/// Gating thresholds. Defaults live here; the snapshot file persists the
/// effective values and env overrides always win (see config).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub min_trades: f64,
    pub probation_trades: f64,
    pub min_avg_r: f64,
    pub max_stdev_r: f64,
    pub max_missing_frac: f64,
    pub recency_halflife_days: f64,
    pub confidence_notify: f64,
    pub confidence_execute: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_trades: 20.0,
            probation_trades: 50.0,
            min_avg_r: 0.15,
            max_stdev_r: 2.5,
            max_missing_frac: 0.40,
            recency_halflife_days: 7.0,
            confidence_notify: 0.4,
            confidence_execute: 0.7,
        }
    }
}

/// Status from the weighted sample count and edge/volatility bars.
pub fn gate(stats: &FingerprintStats, th: &Thresholds) -> GateStatus {
    let n_eff = stats.count_with_weight;

    if n_eff < th.min_trades {
        return GateStatus::Unproven;
    }
    if n_eff < th.probation_trades {
        return GateStatus::Probation;
    }

    let Some(avg_r) = stats.avg_r else {
        return GateStatus::Probation;
    };
    if avg_r < th.min_avg_r {
        return GateStatus::Probation;
    }
    if let Some(stdev) = stats.stdev_r {
        if stdev > th.max_stdev_r {
            return GateStatus::Probation;
        }
    }

    GateStatus::Approved
}

/// Confidence in [0, 1]: product of a sample-size ramp, a logistic edge
/// score, a volatility penalty, exponential recency decay, and a
/// missing-data penalty.
pub fn confidence(stats: &FingerprintStats, th: &Thresholds, now_ms_val: i64) -> f64 {
    let n_eff = stats.count_with_weight;
    let avg_r = stats.avg_r.unwrap_or(0.0);
    let stdev_r = stats.stdev_r.unwrap_or(0.0);

    let sample_score = if n_eff <= 0.0 {
        0.0
    } else if n_eff < th.min_trades {
        n_eff / th.min_trades.max(1.0)
    } else {
        (n_eff / th.probation_trades.max(1.0)).min(1.0)
    };

    let edge_score = 1.0 / (1.0 + (-(avg_r - th.min_avg_r)).exp());
    let vol_penalty = 1.0 / (1.0 + stdev_r);

    let last_seen = if stats.last_seen_ms > 0 { stats.last_seen_ms } else { now_ms_val };
    let age_days = ((now_ms_val - last_seen).max(0)) as f64 / 86_400_000.0;
    let recency = 0.5_f64.powf(age_days / th.recency_halflife_days.max(0.1));

    let missing_frac = stats.missing_fraction();
    let missing_penalty = if missing_frac > th.max_missing_frac {
        (1.0 - (missing_frac - th.max_missing_frac) * 2.0).max(0.0)
    } else {
        1.0
    };

    (sample_score * edge_score * vol_penalty * recency * missing_penalty).clamp(0.0, 1.0)
}

/// Full allow/deny verdict with a human-readable reason.
pub struct Verdict {
    pub allow: bool,
    pub reason: String,
    pub confidence: f64,
    pub status: GateStatus,
}

pub fn should_allow(stats: &FingerprintStats, th: &Thresholds) -> Verdict {
    let status = gate(stats, th);
    let conf = confidence(stats, th, now_ms());

    if status == GateStatus::Unproven {
        return Verdict {
            allow: false,
            reason: "UNPROVEN (insufficient outcomes)".to_string(),
            confidence: conf,
            status,
        };
    }

    if let Some(avg_r) = stats.avg_r {
        if avg_r < 0.0 {
            return Verdict {
                allow: false,
                reason: "NEG_EDGE (avg_r < 0)".to_string(),
                confidence: conf,
                status,
            };
        }
    }

    let missing_frac = stats.missing_fraction();
    if missing_frac > th.max_missing_frac {
        return Verdict {
            allow: false,
            reason: format!("DATA_QUALITY (missing_frac={missing_frac:.2})"),
            confidence: conf,
            status,
        };
    }

    if status == GateStatus::Probation && conf < th.confidence_notify {
        return Verdict {
            allow: false,
            reason: format!("PROBATION_LOW_CONF (conf={conf:.2})"),
            confidence: conf,
            status,
        };
    }

    let label = if status == GateStatus::Probation { "PROBATION_OK" } else { "APPROVED" };
    Verdict { allow: true, reason: format!("{label} (conf={conf:.2})"), confidence: conf, status }
}

/// Record the verdict in the fingerprint's rejection memory: a denial stores
/// the reason and bumps counters; an allowance clears the standing reason.
pub fn apply_rejection_memory(stats: &mut FingerprintStats, verdict: &Verdict) {
    stats.status = verdict.status;
    stats.confidence = verdict.confidence;

    if verdict.allow {
        stats.rejection_reason = None;
        return;
    }

    let now = now_ms();
    stats.rejection_reason = Some(verdict.reason.clone());
    stats.rejection_count += 1;
    if stats.first_rejected_ms.is_none() {
        stats.first_rejected_ms = Some(now);
    }
    stats.last_rejected_ms = Some(now);
}
