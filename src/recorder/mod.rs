//! Outcome recorder: tails the raw execution log and turns heterogeneous
//! exchange fill rows into canonical non-terminal outcome events.
//!
//! At-least-once by design: the cursor is flushed every N lines, not every
//! line, so a crash re-reads a tail of the log; the dedupe window absorbs
//! the replay.

pub mod rows;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::events::builders::{build_outcome_record, OutcomeParts};
use crate::events::pending::PendingRegistry;
use crate::events::spine::EventSpine;
use crate::events::types::{now_ms, value_as_f64, Event, ExecutionMode, JsonMap, SetupEvent};
use crate::storage::{read_new_lines, Cursor};

use rows::{
    exec_id_from_row, extract_rows, fill_cashflow, normalize_ts_ms, num_field, realized_pnl,
    str_field, trade_id_from_row, DedupeWindow,
};

const DEDUPE_CAP: usize = 5_000;
const HINT_CACHE_TTL_MS: i64 = 1_500;

/// TTL-cached, lockless view of the pending registry used to back-fill
/// identity fields on bare execution rows. Hints are best-effort only;
/// anything that mutates the registry re-reads fresh under lock.
struct HintCache {
    registry: Arc<PendingRegistry>,
    map: crate::events::pending::PendingMap,
    loaded_ms: i64,
}

impl HintCache {
    fn new(registry: Arc<PendingRegistry>) -> Self {
        Self { registry, map: Default::default(), loaded_ms: 0 }
    }

    fn lookup(&mut self, ids: &[&str]) -> Option<SetupEvent> {
        let now = now_ms();
        if now - self.loaded_ms >= HINT_CACHE_TTL_MS {
            self.map = self.registry.load();
            self.loaded_ms = now;
        }
        ids.iter()
            .filter(|id| !id.is_empty())
            .find_map(|id| self.map.get(*id))
            .cloned()
    }
}

pub struct OutcomeRecorder {
    exec_log: PathBuf,
    cursor: Cursor,
    pos: u64,
    flush_every: usize,
    poll: Duration,
    spine: Arc<EventSpine>,
    dedupe: DedupeWindow,
    hints: HintCache,
}

impl OutcomeRecorder {
    pub fn new(cfg: &PipelineConfig, spine: Arc<EventSpine>) -> Self {
        let cursor = Cursor::new(cfg.recorder_cursor_path());
        let pos = cursor.load();
        let registry = Arc::clone(spine.registry());
        Self {
            exec_log: cfg.exec_log_path(),
            cursor,
            pos,
            flush_every: cfg.cursor_flush_every,
            poll: cfg.poll_interval(),
            spine,
            dedupe: DedupeWindow::new(DEDUPE_CAP),
            hints: HintCache::new(registry),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            exec_log = %self.exec_log.display(),
            cursor = self.pos,
            poll_ms = self.poll.as_millis() as u64,
            flush_every = self.flush_every,
            "outcome recorder started"
        );

        loop {
            self.drain_once();

            tokio::select! {
                _ = tokio::time::sleep(self.poll) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Finish whatever landed while we slept, then persist the cursor.
        self.drain_once();
        self.cursor.save(self.pos);
        info!(cursor = self.pos, "outcome recorder stopped");
    }

    /// One batch: read every new complete line, publish fills, flush the
    /// cursor every `flush_every` lines and once at the end.
    pub fn drain_once(&mut self) -> usize {
        let path = self.exec_log.clone();
        let mut published = 0usize;
        let mut since_flush = 0usize;
        let flush_every = self.flush_every.max(1);

        // Local moves keep the closure borrow-clean.
        let start = self.pos;
        let result = read_new_lines(&path, start, |line, pos| {
            published += self.process_line(line);
            self.pos = pos;
            since_flush += 1;
            if since_flush >= flush_every {
                self.cursor.save(self.pos);
                since_flush = 0;
            }
        });

        match result {
            Ok(end) => {
                self.pos = end;
                if since_flush > 0 || end != start {
                    self.cursor.save(self.pos);
                }
            }
            Err(e) => warn!(path = %path.display(), "execution log read failed: {e}"),
        }

        published
    }

    /// Process one raw log line; returns how many fill events were published.
    fn process_line(&mut self, line: &str) -> usize {
        if line.trim().is_empty() {
            return 0;
        }
        let msg: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                warn!(preview = %truncate(line, 200), "invalid JSON in execution log");
                return 0;
            }
        };

        let mut published = 0;
        for row in extract_rows(&msg) {
            let exec_id = exec_id_from_row(&row);
            if !self.dedupe.insert(&exec_id) {
                debug!(exec_id = %exec_id, "duplicate execution row dropped");
                continue;
            }
            if let Some(event) = self.build_fill(&row) {
                self.spine.publish(Event::OutcomeRecord(event));
                published += 1;
            }
        }
        published
    }

    /// Normalize one execution row into a fill outcome.
    ///
    /// Fills are, by construction, incomplete evidence of trade outcome:
    /// every event built here is non-terminal and never carries a risk
    /// multiple, even when the pending setup has a risk basis.
    fn build_fill(&mut self, row: &JsonMap) -> Option<crate::events::types::OutcomeEvent> {
        let trade_id = trade_id_from_row(row);
        let link_id = str_field(row, &["orderLinkId", "order_link_id"]).unwrap_or("");
        let order_id = str_field(row, &["orderId", "order_id"]).unwrap_or("");
        let hint = self.hints.lookup(&[link_id, order_id, trade_id.as_str()]);

        let symbol = str_field(row, &["symbol"])
            .map(str::to_string)
            .or_else(|| hint.as_ref().map(|h| h.symbol.clone()))?;

        let qty = num_field(row, &["execQty", "qty"]).unwrap_or(0.0);
        if qty <= 0.0 {
            return None;
        }
        let price = num_field(row, &["execPrice", "price"]).unwrap_or(0.0);
        let value = num_field(row, &["execValue", "value"]).unwrap_or(0.0);
        let fee = num_field(row, &["execFee", "fee"]).unwrap_or(0.0);
        let side = str_field(row, &["side"]).unwrap_or("").to_string();

        let account_label = str_field(row, &["account_label", "label"])
            .map(str::to_string)
            .or_else(|| hint.as_ref().map(|h| h.account_label.clone()))
            .unwrap_or_else(|| "main".to_string());
        let strategy = str_field(row, &["strategy", "strategy_name"])
            .map(str::to_string)
            .or_else(|| hint.as_ref().map(|h| h.strategy.clone()))
            .unwrap_or_else(|| "unknown".to_string());
        let timeframe = str_field(row, &["timeframe", "tf"])
            .map(str::to_string)
            .or_else(|| hint.as_ref().map(|h| h.timeframe.clone()));

        let cashflow = fill_cashflow(&side, price, qty, value, fee);
        let realized = realized_pnl(row);
        let pnl_usd = realized.unwrap_or(cashflow);
        let pnl_kind = if realized.is_some() { "realized_pnl" } else { "fill_cashflow" };

        let ts_exec_ms =
            normalize_ts_ms(["execTime", "exec_time", "T", "ts"].iter().find_map(|k| row.get(*k)));
        let exec_type = str_field(row, &["execType", "exec_type", "type"])
            .unwrap_or("execution")
            .to_string();

        let mode = hint
            .as_ref()
            .and_then(|h| h.extra.get("mode"))
            .and_then(Value::as_str)
            .map(ExecutionMode::parse)
            .unwrap_or_default();
        let fingerprint = hint.as_ref().and_then(|h| h.setup_fingerprint.clone());
        let risk_usd = hint
            .as_ref()
            .and_then(|h| h.features.get("risk_usd"))
            .and_then(value_as_f64);

        let extra: JsonMap = [
            ("pnl_kind".to_string(), json!(pnl_kind)),
            ("side".to_string(), json!(side)),
            ("exec_price".to_string(), json!(price)),
            ("exec_qty".to_string(), json!(qty)),
            ("exec_value".to_string(), json!(value)),
            ("exec_fee".to_string(), json!(fee)),
            ("cashflow_usd".to_string(), json!(cashflow)),
            ("realized_pnl_usd".to_string(), json!(realized)),
            ("risk_usd".to_string(), json!(risk_usd)),
            ("ts_exec_ms".to_string(), json!(ts_exec_ms)),
        ]
        .into_iter()
        .collect();

        Some(build_outcome_record(
            &trade_id,
            &symbol,
            &account_label,
            &strategy,
            OutcomeParts {
                timeframe,
                pnl_usd,
                r_multiple: None,
                win: None,
                exit_reason: Some(exec_type),
                is_terminal: Some(false),
                final_status: Some("FILL_EVENT".to_string()),
                synthetic: false,
                mode,
                setup_fingerprint: fingerprint,
                extra,
            },
        ))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
