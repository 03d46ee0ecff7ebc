use std::io::Write;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, bail};
use tracing::info;

use enrollsnap_core::{Snapshot, SnapshotId};
use enrollsnap_diff::DiffOptions;
use enrollsnap_infra::{
    BackgroundWorker, BatchScheduler, Driver, EngineConfig, FixtureUniverse, ForegroundRunner,
    FsSnapshotStore, ManualTimer, ProgressSink, SchedulerContext, SnapshotStore,
};

use crate::render;
use crate::{Args, Cmd};

pub fn run(args: Args, out: &mut dyn Write) -> anyhow::Result<()> {
    let mut config = EngineConfig::from_env();
    if let Some(dir) = args.data_dir {
        config = config.with_data_dir(dir);
    }
    let app = App::open(config, args.universe.as_deref())?;

    match args.cmd {
        Cmd::Start { name, trust_cache } => app.start(name, trust_cache, out),
        Cmd::Process { name, trust_cache } => app.process(name, trust_cache, out),
        Cmd::Tick => app.tick(out),
        Cmd::Worker => app.worker(out),
        Cmd::Status => app.status(out),
        Cmd::List { only_valid } => app.list(only_valid, out),
        Cmd::Show { id, json } => app.show(&id, json, out),
        Cmd::Delete { id } => app.delete(&id, out),
        Cmd::Diff {
            a,
            b,
            diff_only,
            json,
        } => app.diff(&a, &b, DiffOptions { diff_only }, json, out),
        Cmd::Unlock => app.unlock(out),
        Cmd::Check => app.check(out),
    }
}

struct App {
    config: EngineConfig,
    store: Arc<FsSnapshotStore>,
    universe: Option<Arc<FixtureUniverse>>,
}

impl App {
    fn open(config: EngineConfig, universe: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let store = FsSnapshotStore::open(&config.data_dir)
            .with_context(|| format!("open snapshot store at {}", config.data_dir.display()))?;
        let universe = universe
            .map(|path| {
                FixtureUniverse::load(path)
                    .map(Arc::new)
                    .with_context(|| format!("load universe {}", path.display()))
            })
            .transpose()?;

        Ok(Self {
            config,
            store: Arc::new(store),
            universe,
        })
    }

    fn universe(&self) -> anyhow::Result<Arc<FixtureUniverse>> {
        self.universe
            .clone()
            .context("this command needs the enrollment universe; pass --universe PATH")
    }

    fn scheduler(&self) -> anyhow::Result<BatchScheduler> {
        let universe = self.universe()?;
        let ctx = SchedulerContext::new(
            self.store.clone(),
            universe.clone(),
            universe,
            Arc::new(ManualTimer::new()),
            self.config.clone(),
        );
        Ok(BatchScheduler::new(ctx))
    }

    fn completed(&self, id: &str) -> anyhow::Result<Snapshot> {
        let id: SnapshotId = id.parse()?;
        self.store
            .get(&id)?
            .with_context(|| format!("no completed snapshot with id {id}"))
    }

    fn start(&self, name: Option<String>, trust_cache: bool, out: &mut dyn Write) -> anyhow::Result<()> {
        let scheduler = self.scheduler()?;
        scheduler.check_ability()?;
        if !scheduler.start(name, trust_cache)? {
            bail!("a snapshot is already being generated");
        }

        let active = scheduler.active()?.context("started snapshot is not active")?;
        writeln!(out, "Started snapshot {} ({})", active.id(), active.friendly_name())?;
        writeln!(out, "Run `enrollsnap worker` or `enrollsnap tick` to make progress.")?;
        Ok(())
    }

    fn process(&self, name: Option<String>, trust_cache: bool, out: &mut dyn Write) -> anyhow::Result<()> {
        let scheduler = self.scheduler()?;
        scheduler.check_ability()?;

        let done = {
            let mut progress = CliProgress { out: &mut *out, total: 0, done: 0 };
            ForegroundRunner::new(&scheduler).run(name, trust_cache, &mut progress)?
        };

        if !done.is_valid() {
            bail!(
                "snapshot {} ended in error: {}",
                done.id(),
                done.error().unwrap_or("unknown error")
            );
        }
        writeln!(out, "Done! {}", done.descriptor())?;
        writeln!(out, "{}", done.id())?;
        Ok(())
    }

    fn tick(&self, out: &mut dyn Write) -> anyhow::Result<()> {
        let outcome = self.scheduler()?.run_quantum(Driver::Background)?;
        writeln!(out, "{}", render::outcome(&outcome))?;
        Ok(())
    }

    fn worker(&self, out: &mut dyn Write) -> anyhow::Result<()> {
        let scheduler = Arc::new(self.scheduler()?);
        match scheduler.active()? {
            None => {
                writeln!(out, "No snapshot is being generated.")?;
                return Ok(());
            }
            Some(active) if active.is_locked() => {
                bail!("snapshot {} is locked by a foreground run; run `enrollsnap unlock` first", active.id());
            }
            Some(_) => {}
        }

        let poll = self.config.worker_poll_interval;
        scheduler.ensure_scheduled()?;
        let handle = BackgroundWorker::spawn("enrollsnap-worker", scheduler.clone(), poll)?;
        info!(poll_ms = poll.as_millis() as u64, "worker running until the active snapshot ends");

        while scheduler.active()?.is_some_and(|s| !s.is_locked()) {
            thread::sleep(poll);
        }
        let stats = handle.stats();
        handle.shutdown();

        writeln!(
            out,
            "Worker stopped after {} quanta ({} failed, {} snapshot(s) finished).",
            stats.quanta_run, stats.quanta_failed, stats.jobs_finished
        )?;
        Ok(())
    }

    fn status(&self, out: &mut dyn Write) -> anyhow::Result<()> {
        match self.store.load_active()? {
            Some(active) => writeln!(out, "{}", render::status(&active))?,
            None => writeln!(out, "No snapshot is being generated.")?,
        }
        Ok(())
    }

    fn list(&self, only_valid: bool, out: &mut dyn Write) -> anyhow::Result<()> {
        let entries = self.store.list(only_valid)?;
        if entries.is_empty() {
            writeln!(out, "No snapshots.")?;
        }
        for entry in entries {
            writeln!(out, "{}", render::catalog_line(&entry))?;
        }
        Ok(())
    }

    fn show(&self, id: &str, json: bool, out: &mut dyn Write) -> anyhow::Result<()> {
        let snapshot = self.completed(id)?;
        if json {
            writeln!(out, "{}", snapshot.to_json()?)?;
        } else {
            writeln!(out, "{}", render::snapshot(&snapshot))?;
        }
        Ok(())
    }

    fn delete(&self, id: &str, out: &mut dyn Write) -> anyhow::Result<()> {
        let id: SnapshotId = id.parse()?;
        self.store.delete(&id)?;
        writeln!(out, "Deleted snapshot {id}")?;
        Ok(())
    }

    fn diff(&self, a: &str, b: &str, options: DiffOptions, json: bool, out: &mut dyn Write) -> anyhow::Result<()> {
        let universe = self.universe()?;
        let (a, b) = (self.completed(a)?, self.completed(b)?);
        let result = enrollsnap_diff::diff(&a, &b, universe.as_ref(), options);

        if json {
            writeln!(out, "{}", serde_json::to_string_pretty(&result)?)?;
        } else {
            write!(out, "{}", render::diff(&result))?;
        }
        Ok(())
    }

    fn unlock(&self, out: &mut dyn Write) -> anyhow::Result<()> {
        let scheduler = self.scheduler()?;
        if scheduler.active()?.is_none() {
            bail!("no snapshot is being generated");
        }
        let active = scheduler.unlock()?;
        writeln!(out, "Unlocked snapshot {}", active.id())?;
        Ok(())
    }

    fn check(&self, out: &mut dyn Write) -> anyhow::Result<()> {
        let caps = self.scheduler()?.check_ability()?;
        writeln!(out, "Environment is compatible.")?;
        writeln!(out, "provider attribution: {}", caps.provider_attribution)?;
        writeln!(out, "trusted cache: {}", caps.trusted_cache)?;
        writeln!(out, "default name: {}", caps.default_friendly_name())?;
        Ok(())
    }
}

/// Writes a progress line per foreground quantum.
struct CliProgress<'a> {
    out: &'a mut dyn Write,
    total: u64,
    done: u64,
}

impl ProgressSink for CliProgress<'_> {
    fn begin(&mut self, total_units: u64, completed_units: u64) {
        self.total = total_units;
        self.done = completed_units;
        let _ = writeln!(self.out, "Generating snapshot ({total_units} checks)");
    }

    fn tick(&mut self, delta: u64) {
        self.done += delta;
        let _ = writeln!(self.out, "  {}/{} checks", self.done, self.total);
    }
}
