//! Batch scheduler for snapshot generation.
//!
//! ## Design
//!
//! - A job is advanced by bounded **quanta**: each call resolves at most a
//!   budget of (course, user) units, then returns.
//! - All progress lives in the persisted [`Snapshot`]; nothing is kept in
//!   memory between quanta, so a crash loses at most the in-flight unit.
//! - Courses are walked by offset (`offset = committed courses`), users in
//!   ascending id order (`latest_user_id` is the in-course cursor).
//! - Two drivers share the same state machine: a foreground loop
//!   ([`ForegroundRunner`]) and a background tick ([`BackgroundWorker`]).
//!   They differ only in budget and in whether a wakeup is re-armed.
//!
//! ## Locking
//!
//! `locked` is advisory. It makes the background driver stand aside while a
//! foreground driver owns the job, but it does not stop a second foreground
//! driver from racing the first one. This is accepted for a single-operator
//! tool.
//!
//! User id `0` is never a valid user: a fresh cursor starts at `0`.

pub mod foreground;
pub mod timer;
pub mod worker;

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use enrollsnap_core::{
    Capabilities, CheckStrategy, Directory, DomainError, EnrollmentOracle, OracleError, Snapshot,
    Stage, UserId,
};

use crate::config::EngineConfig;
use crate::store::{SnapshotStore, StoreError};

pub use foreground::{ForegroundRunner, ProgressSink};
pub use timer::{ManualTimer, WakeupTimer};
pub use worker::{BackgroundWorker, WorkerHandle, WorkerStats};

/// Maximum number of chained stage steps within one external invocation.
pub const MAX_CHAIN_DEPTH: u32 = 5;

/// Recorded when the chain-depth guard trips.
pub const RUNAWAY_ERROR_MESSAGE: &str = "An unknown error occurred.";

/// Recorded when a job is loaded in a stage the scheduler does not know.
pub const UNKNOWN_STAGE_MESSAGE: &str = "An unknown stage was entered.";

/// Who is invoking the scheduler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Driver {
    /// Synchronous operator loop (CLI). Larger budget, ignores the lock.
    Foreground,
    /// Fire-and-forget timer tick. Smaller budget, stands aside for locked jobs.
    Background,
}

/// Result of one quantum.
#[derive(Debug, Clone, PartialEq)]
pub enum QuantumOutcome {
    /// No active job.
    Idle,
    /// Background driver stood aside for a locked job.
    Skipped,
    /// The budget was zero; nothing was touched.
    NoBudget,
    /// Budget exhausted; progress persisted, more work remains.
    Suspended { completed_units: u64 },
    /// The job reached `end` or `error` and was moved into the catalog.
    Finished(Snapshot),
}

/// What [`BatchScheduler::ensure_scheduled`] found or did.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScheduleState {
    /// No active job.
    NotNeeded,
    /// The active job is owned by a foreground driver.
    Locked,
    /// A re-invocation was already pending.
    AlreadyPending,
    /// A re-invocation was arranged by this call.
    Armed,
}

/// Scheduler error.
///
/// Collaborator failures pass through unchanged so the driver can decide the
/// retry cadence. Job-level failures are recorded on the snapshot instead.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("environment is not compatible: {0}")]
    Incompatible(String),
    #[error("no active snapshot")]
    NoActiveSnapshot,
    #[error("a snapshot is already being generated")]
    AlreadyActive,
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Everything the scheduler talks to, constructed once and passed in.
#[derive(Clone)]
pub struct SchedulerContext {
    pub store: Arc<dyn SnapshotStore>,
    pub oracle: Arc<dyn EnrollmentOracle>,
    pub directory: Arc<dyn Directory>,
    pub timer: Arc<dyn WakeupTimer>,
    pub config: EngineConfig,
}

impl SchedulerContext {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        oracle: Arc<dyn EnrollmentOracle>,
        directory: Arc<dyn Directory>,
        timer: Arc<dyn WakeupTimer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            oracle,
            directory,
            timer,
            config,
        }
    }
}

/// How a `process` step ended.
enum Step {
    /// Budget spent with work remaining.
    Exhausted,
    /// Every course is committed (or the course source ran dry).
    Drained,
}

/// Drives the snapshot state machine forward one quantum at a time.
pub struct BatchScheduler {
    ctx: SchedulerContext,
}

impl BatchScheduler {
    pub fn new(ctx: SchedulerContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    /// Verify the environment can produce trustworthy snapshots.
    pub fn check_ability(&self) -> Result<Capabilities, SchedulerError> {
        let tags = self.ctx.oracle.environment();
        tags.check_compatible()
            .map_err(|e| SchedulerError::Incompatible(e.to_string()))?;
        Ok(tags.capabilities())
    }

    /// The job currently in the active slot.
    pub fn active(&self) -> Result<Option<Snapshot>, SchedulerError> {
        Ok(self.ctx.store.load_active()?)
    }

    /// Start a new job unless one is already active.
    ///
    /// Returns `false` without touching anything when a job is active.
    pub fn start(&self, friendly_name: Option<String>, trust_cache: bool) -> Result<bool, SchedulerError> {
        let caps = self.ctx.oracle.environment().capabilities();
        let friendly_name = friendly_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| caps.default_friendly_name().to_string());
        if trust_cache && !caps.trusted_cache {
            warn!("trusted cache is not supported by this environment; recalculating instead");
        }

        let snapshot = Snapshot::start(Some(friendly_name), trust_cache && caps.trusted_cache);
        if !self.ctx.store.claim_active(&snapshot)? {
            warn!("refusing to start a snapshot while another is active");
            return Ok(false);
        }

        info!(snapshot_id = %snapshot.id(), name = snapshot.friendly_name(), "snapshot started");
        self.ensure_scheduled()?;
        Ok(true)
    }

    /// Mark the active job as foreground-owned.
    pub fn lock(&self) -> Result<Snapshot, SchedulerError> {
        self.set_locked(true)
    }

    /// Release a foreground claim so the background driver may continue.
    pub fn unlock(&self) -> Result<Snapshot, SchedulerError> {
        let snapshot = self.set_locked(false)?;
        self.ensure_scheduled()?;
        Ok(snapshot)
    }

    fn set_locked(&self, locked: bool) -> Result<Snapshot, SchedulerError> {
        let mut snapshot = self
            .ctx
            .store
            .load_active()?
            .ok_or(SchedulerError::NoActiveSnapshot)?;
        if locked {
            snapshot.lock();
        } else {
            snapshot.unlock();
        }
        self.ctx.store.save_active(&snapshot)?;
        debug!(snapshot_id = %snapshot.id(), locked, "snapshot lock changed");
        Ok(snapshot)
    }

    /// Units a quantum may resolve for `driver`.
    pub fn budget_for(&self, driver: Driver, snapshot: &Snapshot) -> u64 {
        let config = &self.ctx.config;
        match driver {
            Driver::Foreground => config.foreground_budget,
            Driver::Background => {
                let tags = snapshot.environment_version_tags();
                let caps = if tags.is_empty() {
                    self.ctx.oracle.environment().capabilities()
                } else {
                    tags.capabilities()
                };
                if caps.legacy_budget {
                    config.legacy_background_budget
                } else {
                    config.background_budget
                }
            }
        }
    }

    /// Zero-argument background callback.
    ///
    /// Errors are logged, and a wakeup is re-armed so the failing unit is
    /// retried on the next tick.
    pub fn background_tick(&self) -> Option<QuantumOutcome> {
        match self.run_quantum(Driver::Background) {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                warn!(error = %err, "background quantum failed; retrying on next tick");
                if let Err(err) = self.ensure_scheduled() {
                    error!(error = %err, "failed to re-arm background wakeup");
                }
                None
            }
        }
    }

    /// Run one quantum with the driver's configured budget.
    pub fn run_quantum(&self, driver: Driver) -> Result<QuantumOutcome, SchedulerError> {
        let Some(snapshot) = self.ctx.store.load_active()? else {
            error!(?driver, "quantum requested without an active snapshot");
            return Ok(QuantumOutcome::Idle);
        };
        let budget = self.budget_for(driver, &snapshot);
        self.run_chained(driver, budget, 0)
    }

    /// Run one quantum with an explicit budget.
    pub fn run_quantum_with_budget(&self, driver: Driver, budget: u64) -> Result<QuantumOutcome, SchedulerError> {
        self.run_chained(driver, budget, 0)
    }

    /// Run one quantum entered at `call_level` chained invocations deep.
    ///
    /// Each stage step (`init`, `process`) counts as one level; a job that
    /// would go past [`MAX_CHAIN_DEPTH`] is failed.
    pub fn run_chained(&self, driver: Driver, budget: u64, call_level: u32) -> Result<QuantumOutcome, SchedulerError> {
        let Some(mut snapshot) = self.ctx.store.load_active()? else {
            error!(?driver, "quantum requested without an active snapshot");
            return Ok(QuantumOutcome::Idle);
        };

        if driver == Driver::Background && snapshot.is_locked() {
            debug!(snapshot_id = %snapshot.id(), "snapshot is locked by a foreground driver; standing aside");
            return Ok(QuantumOutcome::Skipped);
        }

        if budget == 0 {
            return Ok(QuantumOutcome::NoBudget);
        }

        if snapshot.is_terminal() {
            // committed but never cleared: finish the hand-off
            warn!(snapshot_id = %snapshot.id(), stage = %snapshot.stage(), "terminal snapshot found in the active slot");
            return Ok(QuantumOutcome::Finished(self.end(snapshot)?));
        }

        let mut level = call_level;
        loop {
            if level > MAX_CHAIN_DEPTH {
                error!(snapshot_id = %snapshot.id(), level, "chain depth exceeded; failing snapshot");
                snapshot.fail(RUNAWAY_ERROR_MESSAGE)?;
                return Ok(QuantumOutcome::Finished(self.end(snapshot)?));
            }
            level += 1;

            match snapshot.stage().clone() {
                Stage::Init => self.initialize(&mut snapshot)?,
                Stage::Process => break,
                Stage::End | Stage::Error => {
                    return Ok(QuantumOutcome::Finished(self.end(snapshot)?));
                }
                Stage::Unknown(raw) => {
                    error!(snapshot_id = %snapshot.id(), stage = %raw, "unknown stage; failing snapshot");
                    snapshot.fail(UNKNOWN_STAGE_MESSAGE)?;
                    return Ok(QuantumOutcome::Finished(self.end(snapshot)?));
                }
            }
        }

        let mut remaining = budget;
        match self.process(&mut snapshot, &mut remaining)? {
            Step::Exhausted => {
                debug!(
                    snapshot_id = %snapshot.id(),
                    completed_units = snapshot.completed_units(),
                    total_units = snapshot.total_units(),
                    "quantum budget exhausted"
                );
                self.ensure_scheduled()?;
                Ok(QuantumOutcome::Suspended {
                    completed_units: snapshot.completed_units(),
                })
            }
            Step::Drained => Ok(QuantumOutcome::Finished(self.end(snapshot)?)),
        }
    }

    /// `init -> process`: size the universe and record the environment.
    pub fn initialize(&self, snapshot: &mut Snapshot) -> Result<(), SchedulerError> {
        let total_courses = self.ctx.directory.course_count()?;
        let total_users = self.sorted_users()?.len() as u64;
        let tags = self.ctx.oracle.environment();

        snapshot.initialize(total_courses, total_users, tags)?;
        self.ctx.store.save_active(snapshot)?;

        info!(
            snapshot_id = %snapshot.id(),
            total_courses,
            total_users,
            total_units = snapshot.total_units(),
            "snapshot initialized"
        );
        Ok(())
    }

    fn sorted_users(&self) -> Result<Vec<UserId>, SchedulerError> {
        let mut users = self.ctx.directory.user_ids()?;
        users.sort_unstable();
        users.dedup();
        users.retain(|u| u.get() != 0);
        Ok(users)
    }

    fn process(&self, snapshot: &mut Snapshot, remaining: &mut u64) -> Result<Step, SchedulerError> {
        let caps = snapshot.environment_version_tags().capabilities();
        let strategy = CheckStrategy::from_trust_cache(snapshot.trust_cache());
        let users = self.sorted_users()?;
        let per_page = self.ctx.config.courses_per_page.max(1);

        loop {
            if snapshot.course_offset() >= snapshot.total_courses() {
                return Ok(Step::Drained);
            }

            let offset = snapshot.course_offset();
            let page = self.ctx.directory.courses_page(offset, per_page)?;
            if page.is_empty() {
                return Ok(Step::Drained);
            }

            for course_id in page {
                if snapshot.results().contains_key(&course_id) {
                    warn!(snapshot_id = %snapshot.id(), %course_id, "course listed twice by the directory; skipping");
                    continue;
                }

                let (mut cursor, discarded) = snapshot.cursor_for(course_id);
                if discarded {
                    info!(
                        snapshot_id = %snapshot.id(),
                        %course_id,
                        "checkpoint belongs to another course; restarting course from scratch"
                    );
                }

                let pending: Vec<UserId> = users
                    .iter()
                    .copied()
                    .filter(|u| !cursor.has_resolved(*u))
                    .collect();

                for user_id in pending {
                    if *remaining == 0 {
                        self.ctx.store.save_active(snapshot)?;
                        return Ok(Step::Exhausted);
                    }

                    if self.ctx.oracle.is_enrolled(course_id, user_id, strategy)? {
                        cursor.students.insert(user_id);
                        if caps.provider_attribution {
                            let providers = self.ctx.oracle.enrollment_providers(course_id, user_id)?;
                            if !providers.is_empty() {
                                cursor.details.insert(user_id, providers);
                            }
                        }
                    }
                    cursor.latest_user_id = user_id;

                    if !snapshot.record_unit(cursor.clone())? {
                        debug!(snapshot_id = %snapshot.id(), "user universe grew after init; unit not counted");
                    }
                    self.ctx.store.save_active(snapshot)?;
                    *remaining -= 1;
                }

                let enrolled = cursor.students.len();
                snapshot.commit_course(cursor)?;
                self.ctx.store.save_active(snapshot)?;
                debug!(snapshot_id = %snapshot.id(), %course_id, enrolled, "course committed");

                if snapshot.course_offset() >= snapshot.total_courses() {
                    return Ok(Step::Drained);
                }
            }

            if snapshot.course_offset() == offset {
                // the page only repeated committed courses; nothing left to walk
                warn!(snapshot_id = %snapshot.id(), offset, "course listing made no progress; ending snapshot");
                return Ok(Step::Drained);
            }
        }
    }

    /// Arrange a background re-invocation if one is needed and not pending.
    pub fn ensure_scheduled(&self) -> Result<ScheduleState, SchedulerError> {
        let Some(snapshot) = self.ctx.store.load_active()? else {
            return Ok(ScheduleState::NotNeeded);
        };
        if snapshot.is_locked() {
            return Ok(ScheduleState::Locked);
        }
        if self.ctx.timer.is_pending() {
            return Ok(ScheduleState::AlreadyPending);
        }
        self.ctx.timer.arm();
        debug!(snapshot_id = %snapshot.id(), "background wakeup armed");
        Ok(ScheduleState::Armed)
    }

    /// Move a job into the catalog, clear the active slot and cancel wakeups.
    pub fn end(&self, mut snapshot: Snapshot) -> Result<Snapshot, SchedulerError> {
        snapshot.finish();
        self.ctx.store.commit(&snapshot)?;
        self.ctx.store.clear_active()?;
        self.ctx.timer.cancel();

        info!(
            snapshot_id = %snapshot.id(),
            stage = %snapshot.stage(),
            valid = snapshot.is_valid(),
            completed_units = snapshot.completed_units(),
            courses = snapshot.course_offset(),
            "snapshot ended"
        );
        Ok(snapshot)
    }
}
