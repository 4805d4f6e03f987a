//! Weighted running statistics for one setup fingerprint.
//!
//! Every observation is a (clamped risk multiple, learn-weight) pair; the
//! weight comes from the execution mode so simulated results cannot dominate
//! statistics that gate real capital. Mean and stdev run on weighted
//! accumulators (`sum_w`, `sum_wr`, `sum_wr2`); the median reads a bounded
//! recent-value window; drawdown tracks the cumulative weighted curve.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::types::JsonMap;

/// Cap on the recent-value window (median + debugging).
pub const RECENT_VALUES_CAP: usize = 500;

/// Identity snapshot from the first contributing event; purely for humans
/// reading the snapshot file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FingerprintIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_type: Option<String>,
}

/// Accumulated performance for one setup fingerprint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FingerprintStats {
    pub fingerprint: String,
    #[serde(default)]
    pub identity: FingerprintIdentity,

    /// Terminal events folded in (scored or not).
    pub count: u64,
    /// Terminal events that could not be scored (no risk multiple).
    pub missing_count: u64,
    /// Effective weighted sample count (Σw).
    pub count_with_weight: f64,

    pub sum_w: f64,
    pub sum_wr: f64,
    pub sum_wr2: f64,
    pub win_weight: f64,
    pub loss_weight: f64,

    /// Recent (learn_r, weight) pairs, newest last, capped.
    #[serde(default)]
    pub recent: Vec<(f64, f64)>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_r: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_r: Option<f64>,

    // Running drawdown over the cumulative weighted-r curve.
    pub cum_wr: f64,
    pub peak_wr: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_drawdown_r: Option<f64>,

    pub first_seen_ms: i64,
    pub last_seen_ms: i64,

    // Derived on every fold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_r: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdev_r: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub median_r: Option<f64>,

    // Gating results, maintained by the gating layer.
    #[serde(default)]
    pub status: super::gating::GateStatus,
    #[serde(default)]
    pub confidence: f64,

    // Rejection memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default)]
    pub rejection_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_rejected_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rejected_ms: Option<i64>,
}

impl FingerprintStats {
    pub fn new(fingerprint: &str, ts_ms: i64) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            first_seen_ms: ts_ms,
            last_seen_ms: ts_ms,
            ..Self::default()
        }
    }

    /// Fold one scored terminal observation.
    pub fn observe(&mut self, learn_r: f64, weight: f64, ts_ms: i64) {
        self.count += 1;
        self.touch(ts_ms);

        self.sum_w += weight;
        self.sum_wr += learn_r * weight;
        self.sum_wr2 += learn_r * learn_r * weight;
        self.count_with_weight += weight;

        if learn_r > 0.0 {
            self.win_weight += weight;
        } else {
            self.loss_weight += weight;
        }

        self.recent.push((learn_r, weight));
        if self.recent.len() > RECENT_VALUES_CAP {
            let overflow = self.recent.len() - RECENT_VALUES_CAP;
            self.recent.drain(..overflow);
        }

        self.min_r = Some(self.min_r.map_or(learn_r, |m| m.min(learn_r)));
        self.max_r = Some(self.max_r.map_or(learn_r, |m| m.max(learn_r)));

        self.cum_wr += learn_r * weight;
        self.peak_wr = self.peak_wr.max(self.cum_wr);
        let drawdown = self.peak_wr - self.cum_wr;
        self.max_drawdown_r =
            Some(self.max_drawdown_r.map_or(drawdown, |dd| dd.max(drawdown)));

        self.recompute();
    }

    /// Fold one terminal observation that carries no usable risk multiple.
    pub fn observe_missing(&mut self, ts_ms: i64) {
        self.count += 1;
        self.missing_count += 1;
        self.touch(ts_ms);
    }

    fn touch(&mut self, ts_ms: i64) {
        if self.first_seen_ms == 0 || ts_ms < self.first_seen_ms {
            self.first_seen_ms = ts_ms;
        }
        if ts_ms > self.last_seen_ms {
            self.last_seen_ms = ts_ms;
        }
    }

    fn recompute(&mut self) {
        if self.sum_w <= 0.0 {
            self.avg_r = None;
            self.stdev_r = None;
            self.median_r = None;
            return;
        }
        let mean = self.sum_wr / self.sum_w;
        self.avg_r = Some(mean);

        // Weighted population variance from the running accumulators; tiny
        // negatives from float cancellation clamp to zero.
        let var = (self.sum_wr2 / self.sum_w - mean * mean).max(0.0);
        self.stdev_r = Some(var.sqrt());

        self.median_r = median(self.recent.iter().map(|(r, _)| *r));
    }

    pub fn missing_fraction(&self) -> f64 {
        if self.count == 0 {
            return 1.0;
        }
        self.missing_count as f64 / self.count as f64
    }

    pub fn capture_identity(&mut self, identity: FingerprintIdentity) {
        if self.identity.symbol.is_none() {
            self.identity = identity;
        }
    }
}

fn median(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut xs: Vec<f64> = values.collect();
    if xs.is_empty() {
        return None;
    }
    xs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = xs.len() / 2;
    if xs.len() % 2 == 1 {
        Some(xs[mid])
    } else {
        Some(0.5 * (xs[mid - 1] + xs[mid]))
    }
}

/// Sanity bound on incoming raw risk multiples; beyond this the value is
/// treated as missing data, not evidence.
pub const MAX_ABS_RAW_R: f64 = 1_000_000.0;

pub fn sane_raw_r(raw: f64) -> Option<f64> {
    if raw.is_finite() && raw.abs() <= MAX_ABS_RAW_R {
        Some(raw)
    } else {
        None
    }
}

/// Upstream learn-field override: producers that pre-normalize ship
/// `learn_r` + `learn_weight` in an extra map; those win over local
/// mode-based normalization.
pub fn learn_override(extra: &JsonMap) -> Option<(f64, f64)> {
    let r = extra.get("learn_r").and_then(Value::as_f64)?;
    let w = extra.get("learn_weight").and_then(Value::as_f64).unwrap_or(0.0);
    Some((r, w.max(0.0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recompute_reference(pairs: &[(f64, f64)]) -> (f64, f64) {
        let sum_w: f64 = pairs.iter().map(|(_, w)| w).sum();
        let mean = pairs.iter().map(|(r, w)| r * w).sum::<f64>() / sum_w;
        let var = pairs.iter().map(|(r, w)| w * (r - mean).powi(2)).sum::<f64>() / sum_w;
        (mean, var.sqrt())
    }

    #[test]
    fn running_mean_and_stdev_match_independent_recompute() {
        let pairs = [(1.5, 1.0), (-0.5, 0.05), (2.0, 0.5), (0.3, 1.0), (-1.2, 0.05)];
        let mut stats = FingerprintStats::new("fp", 1);
        for (i, (r, w)) in pairs.iter().enumerate() {
            stats.observe(*r, *w, 1 + i as i64);
        }

        let (mean, stdev) = recompute_reference(&pairs);
        assert!((stats.avg_r.unwrap() - mean).abs() < 1e-9);
        assert!((stats.stdev_r.unwrap() - stdev).abs() < 1e-9);
        assert_eq!(stats.count, 5);
        assert!((stats.count_with_weight - 2.6).abs() < 1e-9);
    }

    #[test]
    fn win_loss_weights_split_on_sign() {
        let mut stats = FingerprintStats::new("fp", 1);
        stats.observe(1.0, 0.5, 1);
        stats.observe(-1.0, 1.0, 2);
        stats.observe(0.0, 0.25, 3); // zero counts as loss
        assert_eq!(stats.win_weight, 0.5);
        assert_eq!(stats.loss_weight, 1.25);
    }

    #[test]
    fn drawdown_tracks_cumulative_weighted_curve() {
        let mut stats = FingerprintStats::new("fp", 1);
        // Curve: +2, +1 (peak 3), -4 (cum -1, dd 4), +1 (cum 0, dd 3)
        for (i, r) in [2.0, 1.0, -4.0, 1.0].iter().enumerate() {
            stats.observe(*r, 1.0, 1 + i as i64);
        }
        assert_eq!(stats.max_drawdown_r, Some(4.0));
    }

    #[test]
    fn median_from_recent_window() {
        let mut stats = FingerprintStats::new("fp", 1);
        for r in [3.0, 1.0, 2.0] {
            stats.observe(r, 1.0, 1);
        }
        assert_eq!(stats.median_r, Some(2.0));
        stats.observe(10.0, 1.0, 1);
        assert_eq!(stats.median_r, Some(2.5));
    }

    #[test]
    fn recent_window_is_bounded() {
        let mut stats = FingerprintStats::new("fp", 1);
        for i in 0..(RECENT_VALUES_CAP + 25) {
            stats.observe(i as f64, 1.0, 1);
        }
        assert_eq!(stats.recent.len(), RECENT_VALUES_CAP);
        assert_eq!(stats.recent[0].0, 25.0);
    }

    #[test]
    fn min_max_and_seen_range() {
        let mut stats = FingerprintStats::new("fp", 100);
        stats.observe(-2.0, 1.0, 50);
        stats.observe(3.0, 1.0, 200);
        assert_eq!(stats.min_r, Some(-2.0));
        assert_eq!(stats.max_r, Some(3.0));
        assert_eq!(stats.first_seen_ms, 50);
        assert_eq!(stats.last_seen_ms, 200);
    }

    #[test]
    fn missing_observations_only_move_counters() {
        let mut stats = FingerprintStats::new("fp", 1);
        stats.observe(1.0, 1.0, 1);
        stats.observe_missing(2);
        assert_eq!(stats.count, 2);
        assert_eq!(stats.missing_count, 1);
        assert_eq!(stats.count_with_weight, 1.0);
        assert!((stats.missing_fraction() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn raw_r_sanity_bounds() {
        assert_eq!(sane_raw_r(2.5), Some(2.5));
        assert_eq!(sane_raw_r(f64::NAN), None);
        assert_eq!(sane_raw_r(f64::INFINITY), None);
        assert_eq!(sane_raw_r(2_000_000.0), None);
    }
}
