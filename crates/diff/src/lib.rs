//! Read-time comparison of two completed snapshots.
//!
//! The diff is never persisted: it is recomputed from the two stored
//! snapshots and a live [`EntityResolver`](enrollsnap_core::EntityResolver)
//! whenever a report is rendered.

pub mod engine;
pub mod model;

pub use engine::diff;
pub use model::{
    CourseDiff, DiffNotices, DiffOptions, DiffTotals, ProviderLabel, SideSummary, SnapshotDiff,
    UserDiff,
};
