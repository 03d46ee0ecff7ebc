//! End-to-end scheduler scenarios against the in-memory and filesystem stores.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Barrier, Mutex, RwLock};
use std::thread;

use proptest::prelude::*;

use enrollsnap_core::{
    CheckStrategy, CourseId, Directory, EnrollmentOracle, EnvironmentTags, OracleError, ProviderId,
    Snapshot, Stage, UserId,
};
use enrollsnap_infra::scheduler::{MAX_CHAIN_DEPTH, RUNAWAY_ERROR_MESSAGE, UNKNOWN_STAGE_MESSAGE};
use enrollsnap_infra::{
    BatchScheduler, Driver, EngineConfig, FixtureUniverse, FsSnapshotStore, InMemorySnapshotStore,
    ManualTimer, QuantumOutcome, SchedulerContext, SchedulerError, SnapshotStore, WakeupTimer,
};

fn course(id: u64) -> CourseId {
    CourseId::new(id)
}

fn user(id: u64) -> UserId {
    UserId::new(id)
}

/// Universe that can change between quanta.
struct LiveUniverse(RwLock<FixtureUniverse>);

impl LiveUniverse {
    fn new(universe: FixtureUniverse) -> Arc<Self> {
        Arc::new(Self(RwLock::new(universe)))
    }

    fn update(&self, f: impl FnOnce(FixtureUniverse) -> FixtureUniverse) {
        let mut guard = self.0.write().unwrap();
        let current = std::mem::take(&mut *guard);
        *guard = f(current);
    }
}

impl Directory for LiveUniverse {
    fn course_count(&self) -> Result<u64, OracleError> {
        self.0.read().unwrap().course_count()
    }

    fn courses_page(&self, offset: u64, limit: usize) -> Result<Vec<CourseId>, OracleError> {
        self.0.read().unwrap().courses_page(offset, limit)
    }

    fn user_ids(&self) -> Result<Vec<UserId>, OracleError> {
        self.0.read().unwrap().user_ids()
    }
}

impl EnrollmentOracle for LiveUniverse {
    fn environment(&self) -> EnvironmentTags {
        self.0.read().unwrap().environment()
    }

    fn is_enrolled(&self, course_id: CourseId, user_id: UserId, strategy: CheckStrategy) -> Result<bool, OracleError> {
        self.0.read().unwrap().is_enrolled(course_id, user_id, strategy)
    }

    fn enrollment_providers(&self, course_id: CourseId, user_id: UserId) -> Result<BTreeSet<ProviderId>, OracleError> {
        self.0.read().unwrap().enrollment_providers(course_id, user_id)
    }
}

/// Oracle that fails the first check of one (course, user) pair.
struct FlakyOracle {
    inner: FixtureUniverse,
    fail_once: Mutex<Option<(CourseId, UserId)>>,
    strategies: Mutex<Vec<CheckStrategy>>,
}

impl FlakyOracle {
    fn new(inner: FixtureUniverse, fail_on: Option<(u64, u64)>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_once: Mutex::new(fail_on.map(|(c, u)| (course(c), user(u)))),
            strategies: Mutex::new(Vec::new()),
        })
    }
}

impl EnrollmentOracle for FlakyOracle {
    fn environment(&self) -> EnvironmentTags {
        self.inner.environment()
    }

    fn is_enrolled(&self, course_id: CourseId, user_id: UserId, strategy: CheckStrategy) -> Result<bool, OracleError> {
        self.strategies.lock().unwrap().push(strategy);
        let mut fail_once = self.fail_once.lock().unwrap();
        if *fail_once == Some((course_id, user_id)) {
            *fail_once = None;
            return Err(OracleError::CheckFailed {
                course_id,
                user_id,
                reason: "provider timed out".to_string(),
            });
        }
        self.inner.is_enrolled(course_id, user_id, strategy)
    }

    fn enrollment_providers(&self, course_id: CourseId, user_id: UserId) -> Result<BTreeSet<ProviderId>, OracleError> {
        self.inner.enrollment_providers(course_id, user_id)
    }
}

struct Harness {
    scheduler: BatchScheduler,
    store: Arc<dyn SnapshotStore>,
    timer: Arc<ManualTimer>,
}

fn harness_with(
    store: Arc<dyn SnapshotStore>,
    oracle: Arc<dyn EnrollmentOracle>,
    directory: Arc<dyn Directory>,
    config: EngineConfig,
) -> Harness {
    let timer = Arc::new(ManualTimer::new());
    let ctx = SchedulerContext::new(store.clone(), oracle, directory, timer.clone(), config);
    Harness {
        scheduler: BatchScheduler::new(ctx),
        store,
        timer,
    }
}

fn harness(universe: FixtureUniverse, config: EngineConfig) -> Harness {
    let universe = Arc::new(universe);
    harness_with(InMemorySnapshotStore::arc(), universe.clone(), universe, config)
}

fn run_to_end(scheduler: &BatchScheduler, budget: u64) -> (Snapshot, usize) {
    for quanta in 1..=10_000 {
        match scheduler.run_quantum_with_budget(Driver::Background, budget).unwrap() {
            QuantumOutcome::Finished(done) => return (done, quanta),
            QuantumOutcome::Suspended { .. } => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    panic!("snapshot never finished");
}

#[test]
fn five_courses_three_users_budget_four_takes_four_quanta() {
    let h = harness(FixtureUniverse::grid(5, 3).enroll(1, 1).enroll(5, 3), EngineConfig::default());
    assert!(h.scheduler.start(Some("Grid".to_string()), false).unwrap());

    let mut outcomes = Vec::new();
    loop {
        let outcome = h.scheduler.run_quantum_with_budget(Driver::Background, 4).unwrap();
        let finished = matches!(outcome, QuantumOutcome::Finished(_));
        outcomes.push(outcome);
        if finished {
            break;
        }
    }

    assert_eq!(outcomes.len(), 4);
    assert_eq!(outcomes[0], QuantumOutcome::Suspended { completed_units: 4 });
    assert_eq!(outcomes[1], QuantumOutcome::Suspended { completed_units: 8 });
    assert_eq!(outcomes[2], QuantumOutcome::Suspended { completed_units: 12 });

    let QuantumOutcome::Finished(done) = &outcomes[3] else {
        unreachable!()
    };
    assert_eq!(done.stage(), &Stage::End);
    assert_eq!(done.results().len(), 5);
    assert_eq!(done.completed_units(), 15);
    assert_eq!(done.total_units(), 15);
    assert!(done.is_enrolled(course(1), user(1)));
    assert!(done.is_enrolled(course(5), user(3)));
    assert!(!done.is_enrolled(course(3), user(2)));
    assert!(done.end_time().is_some());

    assert!(h.store.load_active().unwrap().is_none());
    assert!(!h.timer.is_pending());
    let catalog = h.store.list(true).unwrap();
    assert_eq!(catalog.len(), 1);
    assert_eq!(h.store.get(&catalog[0].id).unwrap().as_ref(), Some(done));
}

#[test]
fn failed_oracle_call_is_retried_on_the_next_quantum() {
    let universe = FixtureUniverse::grid(3, 2).enroll(2, 1);
    let oracle = FlakyOracle::new(universe.clone(), Some((2, 1)));
    let h = harness_with(
        InMemorySnapshotStore::arc(),
        oracle,
        Arc::new(universe),
        EngineConfig::default(),
    );
    assert!(h.scheduler.start(None, false).unwrap());

    let err = h
        .scheduler
        .run_quantum_with_budget(Driver::Background, 100)
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Oracle(OracleError::CheckFailed { .. })));

    let stalled = h.store.load_active().unwrap().unwrap();
    assert_eq!(stalled.stage(), &Stage::Process);
    assert_eq!(stalled.completed_units(), 2);
    assert_eq!(stalled.results().keys().copied().collect::<Vec<_>>(), vec![course(1)]);
    assert!(stalled.checkpoint().is_none());

    let (done, _) = run_to_end(&h.scheduler, 100);
    assert!(done.is_valid());
    assert_eq!(done.completed_units(), 6);
    assert!(done.is_enrolled(course(2), user(1)));
}

#[test]
fn background_tick_swallows_errors_and_rearms() {
    let universe = FixtureUniverse::grid(1, 1);
    let oracle = FlakyOracle::new(universe.clone(), Some((1, 1)));
    let h = harness_with(
        InMemorySnapshotStore::arc(),
        oracle,
        Arc::new(universe),
        EngineConfig::default(),
    );
    assert!(h.scheduler.start(None, false).unwrap());
    assert!(h.timer.take_due());

    assert_eq!(h.scheduler.background_tick(), None);
    assert!(h.timer.is_pending());

    assert!(matches!(
        h.scheduler.background_tick(),
        Some(QuantumOutcome::Finished(_))
    ));
    assert!(!h.timer.is_pending());
}

#[test]
fn resuming_from_storage_matches_an_uninterrupted_run() {
    let universe = FixtureUniverse::grid(6, 5)
        .enroll_via(1, 2, ["manual"])
        .enroll_via(3, 5, ["paid-membership", "group"])
        .enroll(4, 1)
        .enroll(6, 5);

    let uninterrupted = harness(universe.clone(), EngineConfig::default().with_courses_per_page(4));
    uninterrupted.scheduler.start(None, false).unwrap();
    let (reference, _) = run_to_end(&uninterrupted.scheduler, 1_000);

    // a fresh scheduler per quantum: nothing survives but the store
    let store = InMemorySnapshotStore::arc();
    let universe = Arc::new(universe);
    let config = EngineConfig::default().with_courses_per_page(4);
    let first = harness_with(store.clone(), universe.clone(), universe.clone(), config.clone());
    first.scheduler.start(None, false).unwrap();

    let resumed = loop {
        let h = harness_with(store.clone(), universe.clone(), universe.clone(), config.clone());
        match h.scheduler.run_quantum_with_budget(Driver::Background, 1).unwrap() {
            QuantumOutcome::Finished(done) => break done,
            QuantumOutcome::Suspended { .. } => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    };

    assert_eq!(resumed.results(), reference.results());
    assert_eq!(resumed.providers(), reference.providers());
    assert_eq!(resumed.completed_units(), reference.completed_units());
    assert_eq!(
        resumed.enrolling_providers(course(3), user(5)),
        Some(&BTreeSet::from([ProviderId::from("group"), ProviderId::from("paid-membership")]))
    );
}

#[test]
fn completed_units_are_monotonic_and_bounded() {
    let h = harness(FixtureUniverse::grid(4, 4), EngineConfig::default());
    h.scheduler.start(None, false).unwrap();

    let mut last = 0;
    loop {
        match h.scheduler.run_quantum_with_budget(Driver::Background, 3).unwrap() {
            QuantumOutcome::Suspended { completed_units } => {
                let active = h.store.load_active().unwrap().unwrap();
                assert!(completed_units >= last);
                assert!(completed_units <= active.total_units());
                assert!(active.course_offset() <= active.total_courses());
                last = completed_units;
            }
            QuantumOutcome::Finished(done) => {
                assert_eq!(done.completed_units(), 16);
                break;
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}

#[test]
fn zero_budget_leaves_the_job_untouched() {
    let store = InMemorySnapshotStore::arc();
    let universe = Arc::new(FixtureUniverse::grid(2, 2));
    let h = harness_with(store.clone(), universe.clone(), universe, EngineConfig::default());
    h.scheduler.start(None, false).unwrap();
    h.scheduler.run_quantum_with_budget(Driver::Background, 1).unwrap();

    let before = store.raw_active().unwrap();
    assert_eq!(
        h.scheduler.run_quantum_with_budget(Driver::Background, 0).unwrap(),
        QuantumOutcome::NoBudget
    );
    assert_eq!(store.raw_active().unwrap(), before);
}

#[test]
fn only_one_job_can_be_active() {
    let h = harness(FixtureUniverse::grid(1, 1), EngineConfig::default());
    assert!(h.scheduler.start(Some("first".to_string()), false).unwrap());
    assert!(!h.scheduler.start(Some("second".to_string()), false).unwrap());
    assert_eq!(h.scheduler.active().unwrap().unwrap().friendly_name(), "first");
}

#[test]
fn concurrent_starts_on_a_shared_directory_admit_one_job() {
    let dir = tempfile::tempdir().unwrap();
    let universe = Arc::new(FixtureUniverse::grid(1, 1));
    let contenders = 4;
    let barrier = Arc::new(Barrier::new(contenders));

    let handles: Vec<_> = (0..contenders)
        .map(|n| {
            let store: Arc<dyn SnapshotStore> = Arc::new(FsSnapshotStore::open(dir.path()).unwrap());
            let h = harness_with(store, universe.clone(), universe.clone(), EngineConfig::default());
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                h.scheduler.start(Some(format!("contender {n}")), false).unwrap()
            })
        })
        .collect();

    let started = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(started, 1);

    let store = FsSnapshotStore::open(dir.path()).unwrap();
    let active = store.load_active().unwrap().unwrap();
    assert!(active.friendly_name().starts_with("contender "));
}

#[test]
fn runaway_chaining_fails_the_job() {
    let h = harness(FixtureUniverse::grid(2, 2), EngineConfig::default());
    h.scheduler.start(None, false).unwrap();

    let outcome = h
        .scheduler
        .run_chained(Driver::Background, 10, MAX_CHAIN_DEPTH + 1)
        .unwrap();
    let QuantumOutcome::Finished(failed) = outcome else {
        panic!("expected a failed job, got {outcome:?}");
    };
    assert_eq!(failed.stage(), &Stage::Error);
    assert_eq!(failed.error(), Some(RUNAWAY_ERROR_MESSAGE));
    assert!(!failed.is_valid());

    assert!(h.store.load_active().unwrap().is_none());
    assert!(h.store.list(true).unwrap().is_empty());
    assert_eq!(h.store.list(false).unwrap().len(), 1);
}

#[test]
fn unknown_stage_fails_the_job() {
    let store = InMemorySnapshotStore::arc();
    let universe = Arc::new(FixtureUniverse::grid(1, 1));
    let h = harness_with(store.clone(), universe.clone(), universe, EngineConfig::default());
    store
        .put_raw_active(r#"{"id":"legacyjob","stage":"paused","friendly_name":"Old"}"#)
        .unwrap();

    let outcome = h.scheduler.run_quantum(Driver::Background).unwrap();
    let QuantumOutcome::Finished(failed) = outcome else {
        panic!("expected a failed job, got {outcome:?}");
    };
    assert_eq!(failed.stage(), &Stage::Error);
    assert_eq!(failed.error(), Some(UNKNOWN_STAGE_MESSAGE));
    assert_eq!(failed.friendly_name(), "Old");
    assert!(store.load_active().unwrap().is_none());
}

#[test]
fn corrupt_stage_is_failed_into_the_catalog() {
    let store = InMemorySnapshotStore::arc();
    let universe = Arc::new(FixtureUniverse::grid(1, 1));
    let h = harness_with(store.clone(), universe.clone(), universe, EngineConfig::default());
    store
        .put_raw_active(r#"{"id":"legacyjob","stage":3,"results":null,"total_courses":null}"#)
        .unwrap();

    let outcome = h.scheduler.run_quantum(Driver::Background).unwrap();
    let QuantumOutcome::Finished(failed) = outcome else {
        panic!("expected a failed job, got {outcome:?}");
    };
    assert_eq!(failed.id().as_str(), "legacyjob");
    assert_eq!(failed.stage(), &Stage::Error);
    assert_eq!(failed.error(), Some(UNKNOWN_STAGE_MESSAGE));

    let catalog = store.list(false).unwrap();
    assert_eq!(catalog.len(), 1);
    assert_eq!(catalog[0].id.as_str(), "legacyjob");
    assert!(!catalog[0].is_valid);

    // the slot was handed off, not overwritten
    assert!(h.scheduler.start(None, false).unwrap());
    assert_eq!(store.list(false).unwrap().len(), 1);
}

#[test]
fn occupied_corrupt_slot_blocks_a_new_start() {
    let store = InMemorySnapshotStore::arc();
    let universe = Arc::new(FixtureUniverse::grid(1, 1));
    let h = harness_with(store.clone(), universe.clone(), universe, EngineConfig::default());
    store
        .put_raw_active(r#"{"id":"legacyjob","stage":"process","results":null}"#)
        .unwrap();

    assert!(!h.scheduler.start(None, false).unwrap());
    assert_eq!(h.scheduler.active().unwrap().unwrap().id().as_str(), "legacyjob");
}

#[test]
fn terminal_job_left_in_the_active_slot_is_recommitted() {
    let h = harness(FixtureUniverse::grid(1, 1), EngineConfig::default());
    let mut done = Snapshot::start(Some("Orphan".to_string()), false);
    done.initialize(0, 0, EnvironmentTags::engine("3.0.0")).unwrap();
    done.finish();
    h.store.save_active(&done).unwrap();

    assert!(matches!(
        h.scheduler.run_quantum(Driver::Background).unwrap(),
        QuantumOutcome::Finished(_)
    ));
    assert!(h.store.load_active().unwrap().is_none());
    assert_eq!(h.store.get(done.id()).unwrap().as_ref(), Some(&done));
}

#[test]
fn locked_job_is_only_advanced_by_the_foreground() {
    let h = harness(FixtureUniverse::grid(2, 2), EngineConfig::default());
    h.scheduler.start(None, false).unwrap();
    h.scheduler.lock().unwrap();

    assert_eq!(
        h.scheduler.run_quantum(Driver::Background).unwrap(),
        QuantumOutcome::Skipped
    );
    assert_eq!(h.store.load_active().unwrap().unwrap().stage(), &Stage::Init);

    assert!(matches!(
        h.scheduler.run_quantum(Driver::Foreground).unwrap(),
        QuantumOutcome::Finished(_)
    ));
}

#[test]
fn no_active_job_is_idle() {
    let h = harness(FixtureUniverse::grid(1, 1), EngineConfig::default());
    assert_eq!(
        h.scheduler.run_quantum(Driver::Background).unwrap(),
        QuantumOutcome::Idle
    );
    assert!(matches!(h.scheduler.lock(), Err(SchedulerError::NoActiveSnapshot)));
}

#[test]
fn provider_attribution_and_trust_cache_follow_the_engine_version() {
    let enrolled = |engine: &str| {
        FixtureUniverse::grid(1, 1)
            .with_environment(EnvironmentTags::engine(engine))
            .enroll_via(1, 1, ["manual"])
    };

    let modern_oracle = FlakyOracle::new(enrolled("3.2.0"), None);
    let modern = harness_with(
        InMemorySnapshotStore::arc(),
        modern_oracle.clone(),
        Arc::new(enrolled("3.2.0")),
        EngineConfig::default(),
    );
    modern.scheduler.start(None, true).unwrap();
    let (done, _) = run_to_end(&modern.scheduler, 10);
    assert_eq!(done.friendly_name(), "After v3.0 Migration");
    assert!(done.enrolling_providers(course(1), user(1)).is_some());
    assert_eq!(*modern_oracle.strategies.lock().unwrap(), vec![CheckStrategy::TrustCache]);

    let legacy_oracle = FlakyOracle::new(enrolled("2.5.0"), None);
    let legacy = harness_with(
        InMemorySnapshotStore::arc(),
        legacy_oracle.clone(),
        Arc::new(enrolled("2.5.0")),
        EngineConfig::default(),
    );
    legacy.scheduler.start(None, true).unwrap();
    let (done, _) = run_to_end(&legacy.scheduler, 10);
    assert_eq!(done.friendly_name(), "Before v3.0 Migration");
    assert!(done.is_enrolled(course(1), user(1)));
    assert!(done.providers().is_empty());
    assert_eq!(*legacy_oracle.strategies.lock().unwrap(), vec![CheckStrategy::Recalculate]);
}

#[test]
fn universe_drift_after_init_is_tolerated() {
    let live = LiveUniverse::new(FixtureUniverse::grid(2, 2).enroll(2, 3));
    let h = harness_with(InMemorySnapshotStore::arc(), live.clone(), live.clone(), EngineConfig::default());
    h.scheduler.start(None, false).unwrap();
    h.scheduler.run_quantum_with_budget(Driver::Background, 1).unwrap();

    // a user and a course appear after the totals were fixed
    live.update(|u| u.with_user(3, "Late").with_course(3, "Late course"));

    let (done, _) = run_to_end(&h.scheduler, 100);
    assert_eq!(done.total_units(), 4);
    assert_eq!(done.completed_units(), 4);
    assert_eq!(done.total_courses(), 2);
    assert_eq!(done.results().len(), 2);
    assert!(done.is_enrolled(course(2), user(3)));
    assert!(!done.results().contains_key(&course(3)));
}

#[test]
fn filesystem_store_resumes_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let universe = Arc::new(FixtureUniverse::grid(3, 3).enroll(2, 2));
    let open = || -> Arc<dyn SnapshotStore> { Arc::new(FsSnapshotStore::open(dir.path()).unwrap()) };

    let h = harness_with(open(), universe.clone(), universe.clone(), EngineConfig::default());
    h.scheduler.start(Some("Durable".to_string()), false).unwrap();
    h.scheduler.run_quantum_with_budget(Driver::Background, 4).unwrap();
    drop(h);

    let h = harness_with(open(), universe.clone(), universe, EngineConfig::default());
    let active = h.scheduler.active().unwrap().unwrap();
    assert_eq!(active.completed_units(), 4);
    assert_eq!(active.checkpoint().map(|c| c.course_id), Some(course(2)));

    let (done, _) = run_to_end(&h.scheduler, 4);
    let stored = open().get(done.id()).unwrap().unwrap();
    assert_eq!(stored, done);
    assert!(stored.is_enrolled(course(2), user(2)));

    let expected: BTreeMap<CourseId, BTreeSet<UserId>> = BTreeMap::from([
        (course(1), BTreeSet::new()),
        (course(2), BTreeSet::from([user(2)])),
        (course(3), BTreeSet::new()),
    ]);
    assert_eq!(stored.results(), &expected);
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        ..ProptestConfig::default()
    })]

    #[test]
    fn any_budget_sequence_yields_the_same_results(budgets in prop::collection::vec(1u64..7, 1..12)) {
        let universe = FixtureUniverse::grid(4, 5)
            .enroll_via(1, 5, ["manual"])
            .enroll(2, 1)
            .enroll(2, 2)
            .enroll_via(4, 3, ["group"]);

        let reference = harness(universe.clone(), EngineConfig::default());
        reference.scheduler.start(None, false).unwrap();
        let (expected, _) = run_to_end(&reference.scheduler, 1_000);

        let h = harness(universe, EngineConfig::default().with_courses_per_page(3));
        h.scheduler.start(None, false).unwrap();
        let mut last = 0;
        let done = loop {
            let budget = budgets[last as usize % budgets.len()];
            match h.scheduler.run_quantum_with_budget(Driver::Background, budget).unwrap() {
                QuantumOutcome::Finished(done) => break done,
                QuantumOutcome::Suspended { completed_units } => {
                    prop_assert!(completed_units > last);
                    last = completed_units;
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        };

        prop_assert_eq!(done.results(), expected.results());
        prop_assert_eq!(done.providers(), expected.providers());
        prop_assert_eq!(done.completed_units(), 20);
    }
}
