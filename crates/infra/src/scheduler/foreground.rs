//! Synchronous foreground driver.

use tracing::{info, warn};

use enrollsnap_core::{Snapshot, Stage};

use super::{BatchScheduler, Driver, QuantumOutcome, SchedulerError};

/// Receives progress from a foreground run.
///
/// All methods default to no-ops; `()` is the silent sink.
pub trait ProgressSink {
    /// Called once the job is initialized, with the totals and units already done.
    fn begin(&mut self, _total_units: u64, _completed_units: u64) {}

    /// Called after each quantum with the number of newly completed units.
    fn tick(&mut self, _delta: u64) {}

    fn finish(&mut self) {}
}

impl ProgressSink for () {}

/// Runs the active job (starting one if needed) to completion in a loop of
/// foreground quanta.
///
/// The job is locked for the duration so background ticks stand aside. If the
/// run is interrupted by an error the job stays locked; `unlock` hands it back
/// to the background driver.
pub struct ForegroundRunner<'a> {
    scheduler: &'a BatchScheduler,
}

impl<'a> ForegroundRunner<'a> {
    pub fn new(scheduler: &'a BatchScheduler) -> Self {
        Self { scheduler }
    }

    pub fn run(
        &self,
        friendly_name: Option<String>,
        trust_cache: bool,
        sink: &mut dyn ProgressSink,
    ) -> Result<Snapshot, SchedulerError> {
        let scheduler = self.scheduler;
        if scheduler.active()?.is_none() && !scheduler.start(friendly_name, trust_cache)? {
            return Err(SchedulerError::AlreadyActive);
        }

        let mut snapshot = scheduler.lock()?;
        if snapshot.stage() == &Stage::Init {
            scheduler.initialize(&mut snapshot)?;
        }
        info!(snapshot_id = %snapshot.id(), total_units = snapshot.total_units(), "foreground run started");

        let mut done = snapshot.completed_units();
        sink.begin(snapshot.total_units(), done);

        loop {
            match scheduler.run_quantum(Driver::Foreground)? {
                QuantumOutcome::Suspended { completed_units } => {
                    sink.tick(completed_units.saturating_sub(done));
                    done = completed_units;
                }
                QuantumOutcome::Finished(finished) => {
                    sink.tick(finished.completed_units().saturating_sub(done));
                    sink.finish();
                    return Ok(finished);
                }
                QuantumOutcome::Idle => {
                    warn!("active snapshot disappeared during a foreground run");
                    return Err(SchedulerError::NoActiveSnapshot);
                }
                QuantumOutcome::NoBudget => {
                    return Err(SchedulerError::Config(
                        "foreground budget must be greater than zero".to_string(),
                    ));
                }
                // foreground ignores the lock
                QuantumOutcome::Skipped => {}
            }
        }
    }
}
