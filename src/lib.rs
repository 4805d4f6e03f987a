//! Tapeline: trade-lifecycle event pipeline.
//!
//! Joins setup-context events with execution outcomes by trade id, reconciles
//! abandoned setups, aggregates weighted per-fingerprint statistics, and
//! tiers proposed trading actions. All inter-component coordination goes
//! through append-only JSONL logs and a small number of lock-protected
//! shared files.

pub mod config;
pub mod events;
pub mod gate;
pub mod perf;
pub mod reconciler;
pub mod recorder;
pub mod storage;
