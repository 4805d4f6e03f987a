//! End-to-end lifecycle tests: raw execution rows through the recorder,
//! spine merge, reconciler, performance store, and gating consumer, all
//! against one temporary state directory.

use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;

use tapeline::config::PipelineConfig;
use tapeline::events::builders::build_setup_context;
use tapeline::events::spine::EventSpine;
use tapeline::events::types::{now_ms, Event, JsonMap};
use tapeline::gate::{GateTier, GatingConsumer};
use tapeline::perf::PerformanceStore;
use tapeline::reconciler::Reconciler;
use tapeline::recorder::OutcomeRecorder;
use tapeline::storage::append_jsonl;

fn features(risk_usd: f64) -> JsonMap {
    [("risk_usd".to_string(), json!(risk_usd)), ("atr_bucket".to_string(), json!("mid"))]
        .into_iter()
        .collect()
}

fn publish_setup(spine: &EventSpine, trade_id: &str, risk_usd: f64) -> String {
    let setup = build_setup_context(
        trade_id,
        "BTCUSDT",
        "main",
        "trend",
        Some("breakout"),
        Some("5m"),
        features(risk_usd),
        JsonMap::new(),
    );
    let fingerprint = setup.setup_fingerprint.clone().unwrap();
    spine.publish(Event::SetupContext(setup));
    fingerprint
}

fn publish_terminal(spine: &EventSpine, trade_id: &str, pnl: f64) {
    use tapeline::events::builders::{build_outcome_record, OutcomeParts};
    spine.publish(Event::OutcomeRecord(build_outcome_record(
        trade_id,
        "BTCUSDT",
        "main",
        "trend",
        OutcomeParts {
            pnl_usd: pnl,
            is_terminal: Some(true),
            exit_reason: Some("TP".into()),
            ..OutcomeParts::default()
        },
    )));
}

#[test]
fn full_lifecycle_from_execution_row_to_gating_decision() {
    let dir = tempdir().unwrap();
    let cfg = PipelineConfig::for_state_dir(dir.path().to_path_buf());
    let spine = Arc::new(EventSpine::from_config(&cfg));

    // 1. Strategy proposes a trade; setup goes pending.
    let fingerprint = publish_setup(&spine, "T1", 10.0);
    assert_eq!(spine.registry().load().len(), 1);

    // 2. The exchange reports a fill; the recorder normalizes it.
    append_jsonl(
        &cfg.exec_log_path(),
        &json!({
            "account_label": "main",
            "data": [{"symbol": "BTCUSDT", "orderLinkId": "T1", "execId": "E1",
                      "side": "Buy", "execPrice": "100", "execQty": "1", "execFee": "0.1"}]
        }),
    )
    .unwrap();
    let mut recorder = OutcomeRecorder::new(&cfg, Arc::clone(&spine));
    assert_eq!(recorder.drain_once(), 1);
    // Fill did not consume the setup.
    assert_eq!(spine.registry().load().len(), 1);

    // 3. The terminal outcome arrives and merges.
    publish_terminal(&spine, "T1", 25.0);
    assert!(spine.registry().load().is_empty());

    // 4. The performance store folds the enriched outcome.
    let mut store = PerformanceStore::open(&cfg);
    let batch = store.update_once();
    assert_eq!(batch.folded, 1);
    let stats = store.record(&fingerprint).unwrap();
    assert_eq!(stats.avg_r, Some(2.5));
    assert_eq!(stats.count, 1);

    // 5. The gating consumer sees the (still unproven) fingerprint.
    let consumer = GatingConsumer::new(&cfg);
    let decision = consumer
        .decide(&json!({"symbol": "BTCUSDT", "fingerprint": fingerprint, "confidence": 0.95}))
        .unwrap();
    assert_eq!(decision.tier, GateTier::LogOnly);
    assert!(decision.reason.starts_with("UNPROVEN"));
}

#[test]
fn abandoned_setup_is_reconciled_exactly_once() {
    let dir = tempdir().unwrap();
    let mut cfg = PipelineConfig::for_state_dir(dir.path().to_path_buf());
    cfg.outcome_ttl_minutes = 30;
    let spine = Arc::new(EventSpine::from_config(&cfg));

    // Setup published 31 minutes ago, no outcome ever arrives.
    let mut setup = build_setup_context(
        "T2",
        "BTCUSDT",
        "main",
        "trend",
        Some("breakout"),
        Some("5m"),
        features(10.0),
        JsonMap::new(),
    );
    setup.ts_ms = now_ms() - 31 * 60_000;
    spine.publish(Event::SetupContext(setup));

    let reconciler = Reconciler::new(&cfg, Arc::clone(&spine));
    assert_eq!(reconciler.scan_once(), 1);
    assert_eq!(reconciler.scan_once(), 0, "second scan must be a no-op");
    assert!(spine.registry().load().is_empty());

    // The synthetic terminal is visible to, and excluded by, the store.
    let mut store = PerformanceStore::open(&cfg);
    let batch = store.update_once();
    assert_eq!(batch.processed_lines, 1);
    assert_eq!(batch.folded, 0);
    assert_eq!(batch.skipped_nonterminal, 1);

    // And a late real terminal for the same trade becomes an orphan, never a
    // second lifecycle closure.
    publish_terminal(&spine, "T2", 5.0);
    let orphans = std::fs::read_to_string(cfg.outcomes_orphans_log_path()).unwrap();
    assert_eq!(orphans.lines().count(), 1);
    let batch = store.update_once();
    assert_eq!(batch.folded, 0);
}

#[test]
fn fingerprint_accumulates_across_many_trades() {
    let dir = tempdir().unwrap();
    let cfg = PipelineConfig::for_state_dir(dir.path().to_path_buf());
    let spine = Arc::new(EventSpine::from_config(&cfg));

    let mut fingerprint = String::new();
    for i in 0..30 {
        let trade_id = format!("T{i}");
        fingerprint = publish_setup(&spine, &trade_id, 10.0);
        publish_terminal(&spine, &trade_id, 20.0);
    }

    let mut store = PerformanceStore::open(&cfg);
    let batch = store.update_once();
    assert_eq!(batch.folded, 30);

    let stats = store.record(&fingerprint).unwrap();
    assert_eq!(stats.count, 30);
    assert_eq!(stats.avg_r, Some(2.0));
    // 30 full-weight trades clears min_trades (20) but not probation (50).
    assert_eq!(format!("{:?}", stats.status), "Probation");

    // With real statistics behind it, the gate can clear NOTIFY.
    let consumer = GatingConsumer::new(&cfg);
    let decision = consumer
        .decide(&json!({
            "label": "main",
            "ts_ms": now_ms(),
            "action": {"type": "open", "symbol": "BTCUSDT", "side": "long",
                        "fingerprint": fingerprint}
        }))
        .unwrap();
    assert_ne!(decision.tier, GateTier::LogOnly);
}

#[test]
fn duplicate_execution_rows_yield_one_outcome_event() {
    let dir = tempdir().unwrap();
    let cfg = PipelineConfig::for_state_dir(dir.path().to_path_buf());
    let spine = Arc::new(EventSpine::from_config(&cfg));

    let row = json!({"data": {"symbol": "BTCUSDT", "execId": "E-dup", "side": "Sell",
                              "execPrice": "100", "execQty": "1"}});
    append_jsonl(&cfg.exec_log_path(), &row).unwrap();
    append_jsonl(&cfg.exec_log_path(), &row).unwrap();

    let mut recorder = OutcomeRecorder::new(&cfg, Arc::clone(&spine));
    assert_eq!(recorder.drain_once(), 1);

    let raw = std::fs::read_to_string(cfg.outcomes_raw_log_path()).unwrap();
    assert_eq!(raw.lines().count(), 1);
}
