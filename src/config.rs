//! Pipeline configuration.
//!
//! Defaults live in code, `.env` is loaded for convenience, and environment
//! variables always take precedence, including over thresholds persisted in
//! the performance snapshot.

use std::path::PathBuf;
use std::time::Duration;

use crate::perf::gating::Thresholds;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root for all pipeline state files.
    pub state_dir: PathBuf,
    /// Raw execution log (producer-owned); relative paths resolve under
    /// `state_dir`.
    pub exec_log: PathBuf,

    pub poll_seconds: f64,
    pub cursor_flush_every: usize,
    pub outcome_ttl_minutes: u64,
    pub reconcile_seconds: f64,
    pub lock_timeout_secs: f64,
    pub perf_poll_seconds: f64,
    pub allow_synthetic_terminals: bool,
    pub account_label: String,
    pub pending_max_entries: usize,
    pub pending_max_age_days: u64,

    // Gating threshold overrides picked up from the environment; `None`
    // leaves the snapshot/default value in place.
    th_min_trades: Option<f64>,
    th_probation_trades: Option<f64>,
    th_min_avg_r: Option<f64>,
    th_max_stdev_r: Option<f64>,
    th_max_missing_frac: Option<f64>,
    th_recency_halflife_days: Option<f64>,
    th_confidence_notify: Option<f64>,
    th_confidence_execute: Option<f64>,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let state_dir = PathBuf::from(env_string("TAPELINE_STATE_DIR", "state"));

        Self {
            state_dir,
            exec_log: PathBuf::from(env_string("TAPELINE_EXEC_LOG", "ws_executions.jsonl")),
            poll_seconds: env_f64("TAPELINE_POLL_SECONDS", 0.25),
            cursor_flush_every: env_usize("TAPELINE_CURSOR_FLUSH_EVERY", 50),
            outcome_ttl_minutes: env_u64("TAPELINE_OUTCOME_TTL_MINUTES", 30),
            reconcile_seconds: env_f64("TAPELINE_RECONCILE_SECONDS", 10.0),
            lock_timeout_secs: env_f64("TAPELINE_LOCK_TIMEOUT_SECS", 2.5),
            perf_poll_seconds: env_f64("TAPELINE_PERF_POLL_SECONDS", 5.0),
            allow_synthetic_terminals: env_bool("TAPELINE_ALLOW_SYNTHETIC", false),
            account_label: env_string("TAPELINE_ACCOUNT_LABEL", "main"),
            pending_max_entries: env_usize("TAPELINE_PENDING_MAX_ENTRIES", 5_000),
            pending_max_age_days: env_u64("TAPELINE_PENDING_MAX_AGE_DAYS", 14),

            th_min_trades: env_opt_f64("TAPELINE_MIN_TRADES"),
            th_probation_trades: env_opt_f64("TAPELINE_PROBATION_TRADES"),
            th_min_avg_r: env_opt_f64("TAPELINE_MIN_AVG_R"),
            th_max_stdev_r: env_opt_f64("TAPELINE_MAX_STDEV_R"),
            th_max_missing_frac: env_opt_f64("TAPELINE_MAX_MISSING_FRAC"),
            th_recency_halflife_days: env_opt_f64("TAPELINE_RECENCY_HALFLIFE_DAYS"),
            th_confidence_notify: env_opt_f64("TAPELINE_CONFIDENCE_NOTIFY"),
            th_confidence_execute: env_opt_f64("TAPELINE_CONFIDENCE_EXECUTE"),
        }
    }

    /// All defaults under an explicit state root; used by tests and tools
    /// that must not read the ambient environment.
    pub fn for_state_dir(state_dir: PathBuf) -> Self {
        Self {
            state_dir,
            exec_log: PathBuf::from("ws_executions.jsonl"),
            poll_seconds: 0.25,
            cursor_flush_every: 50,
            outcome_ttl_minutes: 30,
            reconcile_seconds: 10.0,
            lock_timeout_secs: 2.5,
            perf_poll_seconds: 5.0,
            allow_synthetic_terminals: false,
            account_label: "main".to_string(),
            pending_max_entries: 5_000,
            pending_max_age_days: 14,
            th_min_trades: None,
            th_probation_trades: None,
            th_min_avg_r: None,
            th_max_stdev_r: None,
            th_max_missing_frac: None,
            th_recency_halflife_days: None,
            th_confidence_notify: None,
            th_confidence_execute: None,
        }
    }

    /// Env overrides win over whatever `thresholds` currently holds
    /// (defaults or the snapshot's persisted values).
    pub fn apply_threshold_overrides(&self, thresholds: &mut Thresholds) {
        let overrides = [
            (&mut thresholds.min_trades, self.th_min_trades),
            (&mut thresholds.probation_trades, self.th_probation_trades),
            (&mut thresholds.min_avg_r, self.th_min_avg_r),
            (&mut thresholds.max_stdev_r, self.th_max_stdev_r),
            (&mut thresholds.max_missing_frac, self.th_max_missing_frac),
            (&mut thresholds.recency_halflife_days, self.th_recency_halflife_days),
            (&mut thresholds.confidence_notify, self.th_confidence_notify),
            (&mut thresholds.confidence_execute, self.th_confidence_execute),
        ];
        for (slot, value) in overrides {
            if let Some(v) = value {
                *slot = v;
            }
        }
    }

    fn resolve(&self, path: &PathBuf) -> PathBuf {
        if path.is_absolute() {
            path.clone()
        } else {
            self.state_dir.join(path)
        }
    }

    pub fn exec_log_path(&self) -> PathBuf {
        self.resolve(&self.exec_log)
    }

    pub fn recorder_cursor_path(&self) -> PathBuf {
        self.state_dir.join("tapeline.cursor")
    }

    fn events_dir(&self) -> PathBuf {
        self.state_dir.join("ai_events")
    }

    pub fn setups_log_path(&self) -> PathBuf {
        self.events_dir().join("setups.jsonl")
    }

    pub fn outcomes_log_path(&self) -> PathBuf {
        self.events_dir().join("outcomes.jsonl")
    }

    pub fn outcomes_raw_log_path(&self) -> PathBuf {
        self.events_dir().join("outcomes_raw.jsonl")
    }

    pub fn outcomes_orphans_log_path(&self) -> PathBuf {
        self.events_dir().join("outcomes_orphans.jsonl")
    }

    pub fn pending_registry_path(&self) -> PathBuf {
        self.events_dir().join("pending_setups.json")
    }

    fn perf_dir(&self) -> PathBuf {
        self.state_dir.join("perf")
    }

    pub fn perf_snapshot_path(&self) -> PathBuf {
        self.perf_dir().join("setup_perf.json")
    }

    pub fn perf_cursor_path(&self) -> PathBuf {
        self.perf_dir().join("setup_perf.cursor")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_seconds.max(0.05))
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs_f64(self.reconcile_seconds.max(0.5))
    }

    pub fn perf_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.perf_poll_seconds.max(0.5))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.lock_timeout_secs.max(0.1))
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_f64(name: &str, default: f64) -> f64 {
    env_opt_f64(name).unwrap_or(default)
}

fn env_opt_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<f64>().ok())
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_nest_under_state_dir() {
        let cfg = PipelineConfig::for_state_dir(PathBuf::from("/tmp/tapeline-test"));
        assert_eq!(
            cfg.outcomes_log_path(),
            PathBuf::from("/tmp/tapeline-test/ai_events/outcomes.jsonl")
        );
        assert_eq!(
            cfg.perf_snapshot_path(),
            PathBuf::from("/tmp/tapeline-test/perf/setup_perf.json")
        );
        assert_eq!(
            cfg.exec_log_path(),
            PathBuf::from("/tmp/tapeline-test/ws_executions.jsonl")
        );
    }

    #[test]
    fn absolute_exec_log_is_not_rebased() {
        let mut cfg = PipelineConfig::for_state_dir(PathBuf::from("/tmp/s"));
        cfg.exec_log = PathBuf::from("/var/log/executions.jsonl");
        assert_eq!(cfg.exec_log_path(), PathBuf::from("/var/log/executions.jsonl"));
    }

    #[test]
    fn threshold_overrides_apply_only_when_set() {
        let mut cfg = PipelineConfig::for_state_dir(PathBuf::from("/tmp/s"));
        cfg.th_min_trades = Some(5.0);
        cfg.th_confidence_execute = Some(0.9);

        let mut th = Thresholds::default();
        cfg.apply_threshold_overrides(&mut th);
        assert_eq!(th.min_trades, 5.0);
        assert_eq!(th.confidence_execute, 0.9);
        // Untouched values keep their incoming settings.
        assert_eq!(th.probation_trades, 50.0);
    }

    #[test]
    fn intervals_have_sane_floors() {
        let mut cfg = PipelineConfig::for_state_dir(PathBuf::from("/tmp/s"));
        cfg.poll_seconds = 0.0;
        cfg.reconcile_seconds = 0.0;
        assert!(cfg.poll_interval() >= Duration::from_millis(50));
        assert!(cfg.reconcile_interval() >= Duration::from_millis(500));
    }
}
