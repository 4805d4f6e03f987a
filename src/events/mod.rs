//! Event spine: canonical event shapes, builders, fingerprinting, the
//! pending registry, and the publisher that joins setups with outcomes.

pub mod builders;
pub mod fingerprint;
pub mod pending;
pub mod spine;
pub mod types;

pub use builders::{build_outcome_record, build_setup_context, OutcomeParts};
pub use pending::{PendingMap, PendingRegistry};
pub use spine::{EventSpine, SpinePaths};
pub use types::{
    merge_setup_and_outcome, now_ms, EnrichedOutcome, Event, ExecutionMode, JsonMap, MergeStats,
    OutcomeEvent, SetupEvent,
};
