//! Event spine: the single publisher every producer hands events to.
//!
//! Owns the event logs and the pending registry, performs the setup/outcome
//! merge, and fans every published event out to same-process listeners over a
//! broadcast channel (non-durable, best-effort).
//!
//! `publish` never fails: trading callers must not be blocked by a full disk
//! or a locked file, so every storage error is logged and swallowed.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::storage::append_jsonl;

use super::pending::PendingRegistry;
use super::types::{merge_setup_and_outcome, Event, OutcomeEvent};

const FANOUT_CAPACITY: usize = 1024;

pub struct SpinePaths {
    pub setups: PathBuf,
    pub outcomes: PathBuf,
    pub outcomes_raw: PathBuf,
    pub outcomes_orphans: PathBuf,
}

pub struct EventSpine {
    paths: SpinePaths,
    registry: Arc<PendingRegistry>,
    fanout: broadcast::Sender<Event>,
}

impl EventSpine {
    pub fn new(paths: SpinePaths, registry: Arc<PendingRegistry>) -> Self {
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        Self { paths, registry, fanout }
    }

    /// Standard wiring from pipeline configuration.
    pub fn from_config(cfg: &crate::config::PipelineConfig) -> Self {
        let registry = Arc::new(PendingRegistry::new(
            cfg.pending_registry_path(),
            cfg.lock_timeout(),
            cfg.pending_max_entries,
            cfg.pending_max_age_days,
        ));
        Self::new(
            SpinePaths {
                setups: cfg.setups_log_path(),
                outcomes: cfg.outcomes_log_path(),
                outcomes_raw: cfg.outcomes_raw_log_path(),
                outcomes_orphans: cfg.outcomes_orphans_log_path(),
            },
            registry,
        )
    }

    pub fn registry(&self) -> &Arc<PendingRegistry> {
        &self.registry
    }

    /// Subscribe to the in-process fan-out. No delivery guarantee: slow
    /// receivers lag and drop.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.fanout.subscribe()
    }

    /// Publish one event: stamp, persist, route, fan out. Infallible.
    pub fn publish(&self, mut event: Event) {
        event.ensure_ts();

        match &event {
            Event::SetupContext(setup) => {
                if let Err(e) = append_jsonl(&self.paths.setups, &event) {
                    warn!(trade_id = %setup.trade_id, "failed to append setup: {e}");
                }
                if let Err(e) = self.registry.upsert(setup) {
                    warn!(trade_id = %setup.trade_id, "failed to update pending registry: {e}");
                }
            }
            Event::OutcomeRecord(outcome) => {
                // Raw audit first, always: replay/debugging must see every
                // outcome exactly as published, merged or not.
                if let Err(e) = append_jsonl(&self.paths.outcomes_raw, &event) {
                    warn!(trade_id = %outcome.trade_id, "failed to append raw outcome: {e}");
                }
                self.route_outcome(outcome, &event);
            }
            Event::OutcomeEnriched(enriched) => {
                // Producers normally don't publish enriched events; accept
                // and persist them anyway so replays stay lossless.
                debug!(trade_id = %enriched.trade_id, "enriched event published directly");
                if let Err(e) = append_jsonl(&self.paths.outcomes, &event) {
                    warn!(trade_id = %enriched.trade_id, "failed to append enriched outcome: {e}");
                }
            }
        }

        // In-process listeners; a send error only means nobody is listening.
        let _ = self.fanout.send(event);
    }

    fn route_outcome(&self, outcome: &OutcomeEvent, event: &Event) {
        // Synthetic terminals come from the reconciler, which owns the
        // registry removal for them; merging here would double-handle.
        if outcome.synthetic {
            if let Err(e) = append_jsonl(&self.paths.outcomes, event) {
                warn!(trade_id = %outcome.trade_id, "failed to append synthetic outcome: {e}");
            }
            return;
        }

        // Fills are incomplete evidence: they never consume the pending
        // setup, so the trade can still merge on its real terminal outcome.
        if outcome.terminal_flag() == Some(false) {
            if let Err(e) = append_jsonl(&self.paths.outcomes, event) {
                warn!(trade_id = %outcome.trade_id, "failed to append fill outcome: {e}");
            }
            return;
        }

        let merged = self.try_merge(outcome);
        if !merged {
            // Out-of-order arrival or a setup that was never logged.
            debug!(trade_id = %outcome.trade_id, "no pending setup; outcome kept as orphan");
            if let Err(e) = append_jsonl(&self.paths.outcomes_orphans, event) {
                warn!(trade_id = %outcome.trade_id, "failed to append orphan outcome: {e}");
            }
        }
    }

    /// Merge against the pending registry. The enriched record is appended
    /// while the registry entry still exists; only a successful append
    /// removes the entry, so a crash can duplicate but never lose a trade.
    fn try_merge(&self, outcome: &OutcomeEvent) -> bool {
        let outcomes_path = self.paths.outcomes.clone();
        let outcome = outcome.clone();
        let log_trade_id = outcome.trade_id.clone();

        let result = self.registry.mutate(move |map| {
            let Some(setup) = map.get(&outcome.trade_id) else {
                return (false, false);
            };

            let enriched = merge_setup_and_outcome(setup, &outcome);
            let trade_id = enriched.trade_id.clone();
            match append_jsonl(&outcomes_path, &Event::OutcomeEnriched(enriched)) {
                Ok(()) => {
                    map.remove(&outcome.trade_id);
                    (true, true)
                }
                Err(e) => {
                    // Keep the entry; the reconciler will eventually expire
                    // it if the outcome never lands.
                    warn!(trade_id = %trade_id, "failed to append enriched outcome: {e}");
                    (false, true)
                }
            }
        });

        match result {
            Ok(matched) => matched,
            Err(e) => {
                warn!(trade_id = %log_trade_id, "pending registry mutation failed: {e}");
                false
            }
        }
    }
}
