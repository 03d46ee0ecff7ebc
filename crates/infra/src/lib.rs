//! Infrastructure layer: snapshot persistence, the batch scheduler and its drivers.

pub mod config;
pub mod fixture;
pub mod scheduler;
pub mod store;

pub use config::EngineConfig;
pub use fixture::{FixtureError, FixtureUniverse};
pub use scheduler::{
    BackgroundWorker, BatchScheduler, Driver, ForegroundRunner, ManualTimer, ProgressSink,
    QuantumOutcome, ScheduleState, SchedulerContext, SchedulerError, WakeupTimer, WorkerHandle,
    WorkerStats,
};
pub use store::{FsSnapshotStore, InMemorySnapshotStore, SnapshotStore, StoreError};
