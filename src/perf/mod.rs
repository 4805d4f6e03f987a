//! Performance store: tails the outcome log, folds terminal trainable events
//! into weighted per-fingerprint statistics, and persists the snapshot that
//! gates trading decisions.

pub mod gating;
pub mod stats;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::events::types::{
    now_ms, EnrichedOutcome, Event, ExecutionMode, OutcomeEvent,
};
use crate::storage::{atomic_write_json, read_json, read_new_lines, Cursor};

use gating::{apply_rejection_memory, should_allow, Thresholds};
use stats::{learn_override, sane_raw_r, FingerprintIdentity, FingerprintStats};

const SNAPSHOT_VERSION: u32 = 1;

/// On-disk snapshot: global thresholds plus the per-fingerprint records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfSnapshot {
    pub version: u32,
    pub updated_ms: i64,
    pub thresholds: Thresholds,
    #[serde(default)]
    pub last_batch: BatchSummary,
    #[serde(default)]
    pub fingerprints: BTreeMap<String, FingerprintStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub processed_lines: u64,
    pub folded: u64,
    pub skipped_nonterminal: u64,
    pub skipped_no_fingerprint: u64,
    pub unscored: u64,
    pub cursor: u64,
}

/// Why (or whether) an outcome log line counts toward statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Trainable,
    ExplicitNonTerminal,
    FillMarker,
    SyntheticExcluded,
    NoTerminalSignal,
}

/// Terminal classification for a raw outcome record, in priority order:
/// an explicit non-terminal flag wins, then the legacy fill-status marker,
/// then the synthetic opt-out, then an explicit terminal flag; with no
/// explicit signal at all, the presence of a risk multiple is the heuristic.
pub fn classify_record(rec: &OutcomeEvent, allow_synthetic: bool) -> Classification {
    if rec.is_terminal == Some(false) {
        return Classification::ExplicitNonTerminal;
    }
    if rec
        .final_status
        .as_deref()
        .is_some_and(|s| s.trim().eq_ignore_ascii_case("FILL_EVENT"))
    {
        return Classification::FillMarker;
    }
    if rec.synthetic && !allow_synthetic {
        return Classification::SyntheticExcluded;
    }
    if rec.is_terminal == Some(true) {
        return Classification::Trainable;
    }
    if rec.r_multiple.is_some() {
        return Classification::Trainable;
    }
    Classification::NoTerminalSignal
}

pub fn classify_enriched(evt: &EnrichedOutcome, allow_synthetic: bool) -> Classification {
    if evt.outcome.synthetic && !allow_synthetic {
        return Classification::SyntheticExcluded;
    }
    if evt.outcome.terminal_flag() == Some(false) {
        return Classification::ExplicitNonTerminal;
    }
    Classification::Trainable
}

/// Fingerprint for an enriched outcome: embedded setup first, then the
/// promoted top-level field, then the outcome's own stamp.
fn enriched_fingerprint(evt: &EnrichedOutcome) -> Option<String> {
    evt.setup
        .setup_fingerprint
        .clone()
        .or_else(|| evt.setup_fingerprint.clone())
        .or_else(|| evt.outcome.setup_fingerprint.clone())
}

fn record_fingerprint(rec: &OutcomeEvent) -> Option<String> {
    rec.setup_fingerprint.clone().or_else(|| {
        rec.extra
            .get("setup_fingerprint")
            .and_then(Value::as_str)
            .map(str::to_string)
    })
}

/// One scored observation extracted from an outcome log line.
struct Scored {
    fingerprint: String,
    learn_r: Option<f64>,
    weight: f64,
    ts_ms: i64,
    identity: FingerprintIdentity,
}

pub struct PerformanceStore {
    outcomes_path: PathBuf,
    cursor: Cursor,
    pos: u64,
    snapshot_path: PathBuf,
    poll: Duration,
    allow_synthetic: bool,
    thresholds: Thresholds,
    records: BTreeMap<String, FingerprintStats>,
}

impl PerformanceStore {
    /// Open the store: load the snapshot if one exists, then let env
    /// overrides win over the persisted thresholds.
    pub fn open(cfg: &PipelineConfig) -> Self {
        let snapshot_path = cfg.perf_snapshot_path();
        let cursor = Cursor::new(cfg.perf_cursor_path());
        let pos = cursor.load();

        let (mut thresholds, records) = match read_json::<PerfSnapshot>(&snapshot_path) {
            Ok(Some(snap)) => (snap.thresholds, snap.fingerprints),
            Ok(None) => (Thresholds::default(), BTreeMap::new()),
            Err(e) => {
                warn!(path = %snapshot_path.display(), "snapshot unreadable, starting empty: {e}");
                (Thresholds::default(), BTreeMap::new())
            }
        };
        cfg.apply_threshold_overrides(&mut thresholds);

        Self {
            outcomes_path: cfg.outcomes_log_path(),
            cursor,
            pos,
            snapshot_path,
            poll: cfg.perf_poll_interval(),
            allow_synthetic: cfg.allow_synthetic_terminals,
            thresholds,
            records,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn record(&self, fingerprint: &str) -> Option<&FingerprintStats> {
        self.records.get(fingerprint)
    }

    pub fn fingerprints(&self) -> impl Iterator<Item = (&String, &FingerprintStats)> {
        self.records.iter()
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            outcomes = %self.outcomes_path.display(),
            snapshot = %self.snapshot_path.display(),
            allow_synthetic = self.allow_synthetic,
            "performance store started"
        );

        loop {
            let batch = self.update_once();
            if batch.folded > 0 {
                debug!(
                    folded = batch.folded,
                    skipped_nonterminal = batch.skipped_nonterminal,
                    fingerprints = self.records.len(),
                    "performance batch folded"
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.update_once();
        info!("performance store stopped");
    }

    /// One pass over new outcome log lines; flushes cursor and snapshot.
    pub fn update_once(&mut self) -> BatchSummary {
        let mut batch = BatchSummary::default();
        let path = self.outcomes_path.clone();
        let allow_synthetic = self.allow_synthetic;

        let mut scored: Vec<Scored> = Vec::new();
        let start = self.pos;
        let result = read_new_lines(&path, start, |line, _pos| {
            batch.processed_lines += 1;
            match parse_outcome_line(line, allow_synthetic) {
                LineOutcome::Scored(s) => scored.push(s),
                LineOutcome::SkippedNonTerminal => batch.skipped_nonterminal += 1,
                LineOutcome::SkippedNoFingerprint => batch.skipped_no_fingerprint += 1,
                LineOutcome::SkippedMalformed => {}
            }
        });

        match result {
            Ok(end) => self.pos = end,
            Err(e) => warn!(path = %path.display(), "outcome log read failed: {e}"),
        }

        for s in scored {
            let entry = self
                .records
                .entry(s.fingerprint.clone())
                .or_insert_with(|| FingerprintStats::new(&s.fingerprint, s.ts_ms));
            entry.capture_identity(s.identity);

            match s.learn_r {
                Some(r) if s.weight > 0.0 => {
                    entry.observe(r, s.weight, s.ts_ms);
                    batch.folded += 1;
                }
                _ => {
                    entry.observe_missing(s.ts_ms);
                    batch.unscored += 1;
                }
            }

            let verdict = should_allow(entry, &self.thresholds);
            apply_rejection_memory(entry, &verdict);
        }

        batch.cursor = self.pos;
        self.cursor.save(self.pos);
        self.save_snapshot(&batch);
        batch
    }

    fn save_snapshot(&self, batch: &BatchSummary) {
        let snapshot = PerfSnapshot {
            version: SNAPSHOT_VERSION,
            updated_ms: now_ms(),
            thresholds: self.thresholds.clone(),
            last_batch: batch.clone(),
            fingerprints: self.records.clone(),
        };
        if let Err(e) = atomic_write_json(&self.snapshot_path, &snapshot) {
            warn!(path = %self.snapshot_path.display(), "failed to save snapshot: {e}");
        }
    }
}

enum LineOutcome {
    Scored(Scored),
    SkippedNonTerminal,
    SkippedNoFingerprint,
    SkippedMalformed,
}

fn parse_outcome_line(line: &str, allow_synthetic: bool) -> LineOutcome {
    if line.trim().is_empty() {
        return LineOutcome::SkippedMalformed;
    }
    let event: Event = match serde_json::from_str(line) {
        Ok(e) => e,
        Err(e) => {
            let preview: String = line.chars().take(160).collect();
            debug!(preview = %preview, "unparseable outcome line: {e}");
            return LineOutcome::SkippedMalformed;
        }
    };

    match event {
        Event::OutcomeEnriched(evt) => {
            if classify_enriched(&evt, allow_synthetic) != Classification::Trainable {
                return LineOutcome::SkippedNonTerminal;
            }
            let Some(fingerprint) = enriched_fingerprint(&evt) else {
                return LineOutcome::SkippedNoFingerprint;
            };

            let mode = enriched_mode(&evt);
            let (learn_r, weight) = score(
                evt.stats.r_multiple,
                &evt.outcome.extra,
                mode,
            );

            LineOutcome::Scored(Scored {
                fingerprint,
                learn_r,
                weight,
                ts_ms: if evt.ts_ms > 0 { evt.ts_ms } else { now_ms() },
                identity: FingerprintIdentity {
                    symbol: Some(evt.symbol.clone()),
                    timeframe: Some(evt.timeframe.clone()),
                    account_label: Some(evt.account_label.clone()),
                    strategy: Some(evt.strategy.clone()),
                    setup_type: Some(evt.setup_type.clone()),
                },
            })
        }
        Event::OutcomeRecord(rec) => {
            if classify_record(&rec, allow_synthetic) != Classification::Trainable {
                return LineOutcome::SkippedNonTerminal;
            }
            let Some(fingerprint) = record_fingerprint(&rec) else {
                return LineOutcome::SkippedNoFingerprint;
            };

            let (learn_r, weight) = score(rec.r_multiple, &rec.extra, rec.mode);

            LineOutcome::Scored(Scored {
                fingerprint,
                learn_r,
                weight,
                ts_ms: if rec.ts_ms > 0 { rec.ts_ms } else { now_ms() },
                identity: FingerprintIdentity {
                    symbol: Some(rec.symbol.clone()),
                    timeframe: rec.timeframe.clone(),
                    account_label: Some(rec.account_label.clone()),
                    strategy: Some(rec.strategy.clone()),
                    setup_type: None,
                },
            })
        }
        Event::SetupContext(_) => LineOutcome::SkippedNonTerminal,
    }
}

/// Mode for an enriched outcome: the setup's declared mode wins (it captured
/// the account state at entry), falling back to the outcome's own tag.
fn enriched_mode(evt: &EnrichedOutcome) -> ExecutionMode {
    evt.setup
        .extra
        .get("mode")
        .and_then(Value::as_str)
        .map(ExecutionMode::parse)
        .unwrap_or(evt.outcome.mode)
}

/// Turn a raw risk multiple into a (learn_r, weight) pair: upstream
/// pre-normalized fields win, otherwise clamp and weight by mode.
fn score(
    raw_r: Option<f64>,
    extra: &crate::events::types::JsonMap,
    mode: ExecutionMode,
) -> (Option<f64>, f64) {
    if let Some((learn_r, weight)) = learn_override(extra) {
        return (Some(learn_r), weight);
    }
    match raw_r.and_then(sane_raw_r) {
        Some(raw) => {
            let (learn_r, weight) = mode.normalize_r(raw);
            (Some(learn_r), weight)
        }
        None => (None, 0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::builders::{build_outcome_record, build_setup_context, OutcomeParts};
    use crate::events::types::{merge_setup_and_outcome, JsonMap};
    use crate::storage::append_jsonl;
    use serde_json::json;

    fn store(dir: &std::path::Path) -> PerformanceStore {
        let cfg = PipelineConfig::for_state_dir(dir.to_path_buf());
        PerformanceStore::open(&cfg)
    }

    fn enriched_line(
        dir: &std::path::Path,
        trade_id: &str,
        risk_usd: f64,
        pnl: f64,
        mode: &str,
    ) {
        let features: JsonMap = [("risk_usd".to_string(), json!(risk_usd))].into_iter().collect();
        let extra: JsonMap = [("mode".to_string(), json!(mode))].into_iter().collect();
        let setup = build_setup_context(
            trade_id, "BTCUSDT", "main", "trend", Some("breakout"), Some("5m"), features, extra,
        );
        let outcome = build_outcome_record(
            trade_id,
            "BTCUSDT",
            "main",
            "trend",
            OutcomeParts { pnl_usd: pnl, is_terminal: Some(true), ..OutcomeParts::default() },
        );
        let enriched = merge_setup_and_outcome(&setup, &outcome);
        append_jsonl(
            &dir.join("ai_events/outcomes.jsonl"),
            &Event::OutcomeEnriched(enriched),
        )
        .unwrap();
    }

    #[test]
    fn folds_enriched_terminals_and_skips_fills() {
        let dir = tempfile::tempdir().unwrap();

        enriched_line(dir.path(), "T1", 10.0, 25.0, "LIVE_FULL");

        // A fill record in the same log must be excluded.
        let fill = build_outcome_record(
            "T2",
            "BTCUSDT",
            "main",
            "trend",
            OutcomeParts {
                pnl_usd: -3.0,
                is_terminal: Some(false),
                final_status: Some("FILL_EVENT".into()),
                setup_fingerprint: Some("fp-fill".into()),
                ..OutcomeParts::default()
            },
        );
        append_jsonl(&dir.path().join("ai_events/outcomes.jsonl"), &Event::OutcomeRecord(fill))
            .unwrap();

        let mut store = store(dir.path());
        let batch = store.update_once();

        assert_eq!(batch.folded, 1);
        assert_eq!(batch.skipped_nonterminal, 1);
        assert!(!store.records.contains_key("fp-fill"));

        let (_, stats) = store.records.iter().next().unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.avg_r, Some(2.5));
    }

    #[test]
    fn paper_mode_clamps_and_underweights() {
        let dir = tempfile::tempdir().unwrap();
        // Raw r = 50/10 = 5.0, clamped to 2.0 at weight 0.05 in PAPER mode.
        enriched_line(dir.path(), "T1", 10.0, 50.0, "PAPER");

        let mut store = store(dir.path());
        store.update_once();

        let (_, stats) = store.records.iter().next().unwrap();
        assert_eq!(stats.avg_r, Some(2.0));
        assert!((stats.count_with_weight - 0.05).abs() < 1e-12);
        assert_eq!(stats.status, gating::GateStatus::Unproven);
    }

    #[test]
    fn paper_fleet_never_reaches_approval() {
        let dir = tempfile::tempdir().unwrap();
        // 25 paper terminals weigh in at n_eff = 25 * 0.05 = 1.25: nowhere
        // near approval even though the raw count is 25.
        for i in 0..25 {
            enriched_line(dir.path(), &format!("T{i}"), 10.0, 5.0, "PAPER");
        }
        let mut store = store(dir.path());
        store.update_once();
        let (_, stats) = store.records.iter().next().unwrap();
        assert_eq!(stats.count, 25);
        assert!(stats.count_with_weight < store.thresholds.min_trades);
        assert_eq!(stats.status, gating::GateStatus::Unproven);
    }

    #[test]
    fn synthetic_terminals_excluded_unless_opted_in() {
        let dir = tempfile::tempdir().unwrap();
        let synthetic = build_outcome_record(
            "T1",
            "BTCUSDT",
            "main",
            "trend",
            OutcomeParts {
                is_terminal: Some(true),
                final_status: Some("EXPIRED".into()),
                synthetic: true,
                setup_fingerprint: Some("fp-syn".into()),
                ..OutcomeParts::default()
            },
        );
        append_jsonl(
            &dir.path().join("ai_events/outcomes.jsonl"),
            &Event::OutcomeRecord(synthetic.clone()),
        )
        .unwrap();

        let mut store = store(dir.path());
        let batch = store.update_once();
        assert_eq!(batch.skipped_nonterminal, 1);
        assert!(store.records.is_empty());

        // Opted in: the synthetic is attributed but unscored (no r).
        let dir2 = tempfile::tempdir().unwrap();
        append_jsonl(
            &dir2.path().join("ai_events/outcomes.jsonl"),
            &Event::OutcomeRecord(synthetic),
        )
        .unwrap();
        let cfg = {
            let mut c = PipelineConfig::for_state_dir(dir2.path().to_path_buf());
            c.allow_synthetic_terminals = true;
            c
        };
        let mut store2 = PerformanceStore::open(&cfg);
        let batch2 = store2.update_once();
        assert_eq!(batch2.unscored, 1);
        assert_eq!(store2.records["fp-syn"].missing_count, 1);
    }

    #[test]
    fn terminal_heuristic_uses_r_multiple_when_no_flags() {
        let legacy = OutcomeEvent {
            ts_ms: 1,
            trade_id: "T".into(),
            symbol: "BTCUSDT".into(),
            account_label: "main".into(),
            strategy: "s".into(),
            timeframe: None,
            pnl_usd: 5.0,
            r_multiple: Some(0.5),
            win: Some(true),
            exit_reason: None,
            is_terminal: None,
            final_status: None,
            synthetic: false,
            mode: ExecutionMode::LiveFull,
            setup_fingerprint: Some("fp".into()),
            extra: JsonMap::new(),
        };
        assert_eq!(classify_record(&legacy, false), Classification::Trainable);

        let mut no_r = legacy.clone();
        no_r.r_multiple = None;
        assert_eq!(classify_record(&no_r, false), Classification::NoTerminalSignal);

        let mut explicit_fill = legacy.clone();
        explicit_fill.is_terminal = Some(false);
        assert_eq!(classify_record(&explicit_fill, false), Classification::ExplicitNonTerminal);

        let mut fill_status = legacy;
        fill_status.final_status = Some("FILL_EVENT".into());
        assert_eq!(classify_record(&fill_status, false), Classification::FillMarker);
    }

    #[test]
    fn snapshot_round_trips_across_store_instances() {
        let dir = tempfile::tempdir().unwrap();
        enriched_line(dir.path(), "T1", 10.0, 25.0, "LIVE_FULL");

        let mut store1 = store(dir.path());
        store1.update_once();
        drop(store1);

        // Second instance resumes from the snapshot + cursor: no relearn.
        let mut store2 = store(dir.path());
        let batch = store2.update_once();
        assert_eq!(batch.processed_lines, 0);
        assert_eq!(store2.records.len(), 1);
        let (_, stats) = store2.records.iter().next().unwrap();
        assert_eq!(stats.avg_r, Some(2.5));
    }

    #[test]
    fn unfingerprintable_events_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let rec = build_outcome_record(
            "T1",
            "BTCUSDT",
            "main",
            "trend",
            OutcomeParts { is_terminal: Some(true), r_multiple: Some(1.0), ..OutcomeParts::default() },
        );
        append_jsonl(&dir.path().join("ai_events/outcomes.jsonl"), &Event::OutcomeRecord(rec))
            .unwrap();

        let mut store = store(dir.path());
        let batch = store.update_once();
        assert_eq!(batch.skipped_no_fingerprint, 1);
        assert!(store.records.is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ai_events/outcomes.jsonl");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json\n{\"event_type\":\"mystery\"}\n").unwrap();

        let mut store = store(dir.path());
        let batch = store.update_once();
        assert_eq!(batch.processed_lines, 2);
        assert_eq!(batch.folded, 0);
    }
}
