//! Reconciler: turns abandoned pending setups into synthetic terminal
//! outcomes so no trade lifecycle stays open forever.
//!
//! Runs on a fixed interval against the same registry file the spine owns.
//! Each scan: lock (bounded, fails open), fresh read, emit a synthetic
//! terminal per aborted/expired entry, then rewrite the registry once with
//! the emitted entries removed.
//!
//! Emission and removal are NOT one atomic transaction: a crash between the
//! two re-emits the same synthetic outcome on the next scan. That is the
//! accepted at-least-once contract; consumers dedupe by trade_id +
//! exit_reason.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::events::builders::{build_outcome_record, OutcomeParts};
use crate::events::spine::EventSpine;
use crate::events::types::{now_ms, Event, ExecutionMode, JsonMap, SetupEvent};

pub struct Reconciler {
    spine: Arc<EventSpine>,
    ttl_minutes: u64,
    interval: Duration,
}

impl Reconciler {
    pub fn new(cfg: &PipelineConfig, spine: Arc<EventSpine>) -> Self {
        Self {
            spine,
            ttl_minutes: cfg.outcome_ttl_minutes,
            interval: cfg.reconcile_interval(),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            ttl_minutes = self.ttl_minutes,
            interval_s = self.interval.as_secs(),
            "reconciler started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let emitted = self.scan_once();
                    if emitted > 0 {
                        warn!(emitted, "reconciler emitted synthetic terminal outcomes");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("reconciler stopped");
    }

    /// One scan over the registry. Returns how many synthetic terminals were
    /// emitted. Entries younger than the TTL and not aborted are untouched.
    pub fn scan_once(&self) -> usize {
        let now = now_ms();
        let ttl_ms = self.ttl_minutes as i64 * 60_000;
        let ttl_minutes = self.ttl_minutes;
        let spine = Arc::clone(&self.spine);

        let result = self.spine.registry().mutate(move |map| {
            let due: Vec<(String, SetupEvent)> = map
                .iter()
                .filter(|(_, setup)| {
                    setup.is_aborted() || (setup.ts_ms > 0 && now - setup.ts_ms >= ttl_ms)
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            if due.is_empty() {
                return (false, 0usize);
            }

            let mut emitted = 0usize;
            for (trade_id, setup) in due {
                let event = synthesize_terminal(&setup, ttl_minutes);
                // Emit first; removal follows in one batch below. A crash in
                // between duplicates the emission, never loses it.
                spine.publish(event);
                emitted += 1;
                map.remove(&trade_id);
            }
            (true, emitted)
        });

        match result {
            Ok(emitted) => emitted,
            Err(e) => {
                warn!("reconciler scan failed: {e}");
                0
            }
        }
    }
}

/// Build the synthetic terminal outcome for an abandoned setup: zero pnl,
/// absent risk multiple, and non-training-grade by default (downstream
/// statistics exclude synthetics unless explicitly opted in).
fn synthesize_terminal(setup: &SetupEvent, ttl_minutes: u64) -> Event {
    let (final_status, exit_reason) = if setup.is_aborted() {
        ("ABORTED".to_string(), "ABORTED".to_string())
    } else {
        ("EXPIRED".to_string(), format!("EXPIRED_TIMEOUT_{ttl_minutes}m"))
    };

    let mode = setup
        .extra
        .get("mode")
        .and_then(serde_json::Value::as_str)
        .map(ExecutionMode::parse)
        .unwrap_or_default();

    let extra: JsonMap = [
        ("setup_ts_ms".to_string(), json!(setup.ts_ms)),
        ("setup_type".to_string(), json!(setup.setup_type)),
        ("pnl_kind".to_string(), json!("synthetic")),
    ]
    .into_iter()
    .collect();

    Event::OutcomeRecord(build_outcome_record(
        &setup.trade_id,
        &setup.symbol,
        &setup.account_label,
        &setup.strategy,
        OutcomeParts {
            timeframe: Some(setup.timeframe.clone()),
            pnl_usd: 0.0,
            r_multiple: None,
            win: None,
            exit_reason: Some(exit_reason),
            is_terminal: Some(true),
            final_status: Some(final_status),
            synthetic: true,
            mode,
            setup_fingerprint: setup.setup_fingerprint.clone(),
            extra,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::builders::build_setup_context;
    use crate::events::pending::PendingRegistry;
    use crate::events::spine::SpinePaths;
    use crate::events::types::OutcomeEvent;
    use serde_json::Value;
    use std::fs;

    fn pipeline(dir: &std::path::Path, ttl_minutes: u64) -> (Arc<EventSpine>, Reconciler) {
        let mut cfg = PipelineConfig::for_state_dir(dir.to_path_buf());
        cfg.outcome_ttl_minutes = ttl_minutes;
        let registry = Arc::new(PendingRegistry::new(
            cfg.pending_registry_path(),
            Duration::from_millis(100),
            5_000,
            14,
        ));
        let spine = Arc::new(EventSpine::new(
            SpinePaths {
                setups: cfg.setups_log_path(),
                outcomes: cfg.outcomes_log_path(),
                outcomes_raw: cfg.outcomes_raw_log_path(),
                outcomes_orphans: cfg.outcomes_orphans_log_path(),
            },
            registry,
        ));
        let reconciler = Reconciler::new(&cfg, Arc::clone(&spine));
        (spine, reconciler)
    }

    fn publish_setup(spine: &EventSpine, trade_id: &str, age_ms: i64, aborted: bool) {
        let mut setup = build_setup_context(
            trade_id,
            "BTCUSDT",
            "main",
            "trend",
            Some("breakout"),
            Some("5m"),
            JsonMap::new(),
            JsonMap::new(),
        );
        setup.ts_ms = now_ms() - age_ms;
        setup.aborted = aborted;
        spine.publish(Event::SetupContext(setup));
    }

    fn outcome_records(dir: &std::path::Path) -> Vec<OutcomeEvent> {
        let path = dir.join("ai_events/outcomes.jsonl");
        match fs::read_to_string(path) {
            Ok(text) => text
                .lines()
                .filter_map(|l| match serde_json::from_str::<Event>(l) {
                    Ok(Event::OutcomeRecord(rec)) => Some(rec),
                    _ => None,
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    #[test]
    fn expired_setup_yields_synthetic_terminal_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let (spine, reconciler) = pipeline(dir.path(), 30);

        publish_setup(&spine, "T-OLD", 31 * 60_000, false);
        assert_eq!(reconciler.scan_once(), 1);

        let records = outcome_records(dir.path());
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.exit_reason.as_deref(), Some("EXPIRED_TIMEOUT_30m"));
        assert_eq!(rec.pnl_usd, 0.0);
        assert_eq!(rec.r_multiple, None);
        assert!(rec.synthetic);
        assert_eq!(rec.is_terminal, Some(true));

        assert!(spine.registry().load().is_empty());
        // Idempotent: nothing left to emit.
        assert_eq!(reconciler.scan_once(), 0);
    }

    #[test]
    fn young_setup_is_never_touched() {
        let dir = tempfile::tempdir().unwrap();
        let (spine, reconciler) = pipeline(dir.path(), 30);

        publish_setup(&spine, "T-YOUNG", 5 * 60_000, false);
        assert_eq!(reconciler.scan_once(), 0);
        assert_eq!(spine.registry().load().len(), 1);
        assert!(outcome_records(dir.path()).is_empty());
    }

    #[test]
    fn aborted_setup_is_reconciled_regardless_of_age() {
        let dir = tempfile::tempdir().unwrap();
        let (spine, reconciler) = pipeline(dir.path(), 30);

        publish_setup(&spine, "T-AB", 1_000, true);
        assert_eq!(reconciler.scan_once(), 1);

        let records = outcome_records(dir.path());
        assert_eq!(records[0].exit_reason.as_deref(), Some("ABORTED"));
        assert_eq!(records[0].final_status.as_deref(), Some("ABORTED"));
        assert!(spine.registry().load().is_empty());
    }

    #[test]
    fn batch_scan_handles_mixed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (spine, reconciler) = pipeline(dir.path(), 30);

        publish_setup(&spine, "T1", 40 * 60_000, false);
        publish_setup(&spine, "T2", 1_000, true);
        publish_setup(&spine, "T3", 1_000, false);

        assert_eq!(reconciler.scan_once(), 2);
        let map = spine.registry().load();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("T3"));
    }

    #[test]
    fn synthetic_carries_setup_mode_and_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let (spine, reconciler) = pipeline(dir.path(), 30);

        let extra: JsonMap =
            [("mode".to_string(), Value::String("PAPER".into()))].into_iter().collect();
        let mut setup = build_setup_context(
            "T1", "BTCUSDT", "main", "trend", Some("breakout"), Some("5m"),
            JsonMap::new(), extra,
        );
        setup.ts_ms = now_ms() - 40 * 60_000;
        let fingerprint = setup.setup_fingerprint.clone();
        spine.publish(Event::SetupContext(setup));

        reconciler.scan_once();
        let rec = &outcome_records(dir.path())[0];
        assert_eq!(rec.mode, ExecutionMode::Paper);
        assert_eq!(rec.setup_fingerprint, fingerprint);
    }
}
