//! Background driver thread.
//!
//! Polls the [`WakeupTimer`](super::WakeupTimer) and runs one background
//! quantum per due wakeup. Each quantum re-arms the timer while work remains,
//! so the worker keeps a job moving without the caller holding a loop.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use super::{BatchScheduler, QuantumOutcome};

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub quanta_run: u64,
    pub quanta_failed: u64,
    pub jobs_finished: u64,
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

/// Spawns the background driver.
pub struct BackgroundWorker;

impl BackgroundWorker {
    pub fn spawn(
        name: impl Into<String>,
        scheduler: Arc<BatchScheduler>,
        poll_interval: Duration,
    ) -> std::io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();
        let name = name.into();

        let join = thread::Builder::new().name(name.clone()).spawn(move || {
            worker_loop(&name, &scheduler, poll_interval, shutdown_rx, &stats_clone);
        })?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn worker_loop(
    name: &str,
    scheduler: &BatchScheduler,
    poll_interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
    stats: &Mutex<WorkerStats>,
) {
    info!(worker = %name, "snapshot worker started");

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        if !scheduler.context().timer.take_due() {
            match shutdown_rx.recv_timeout(poll_interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                // shutdown requested or every handle dropped
                _ => break,
            }
        }

        let outcome = scheduler.background_tick();
        debug!(worker = %name, ?outcome, "background quantum ran");

        if let Ok(mut s) = stats.lock() {
            s.quanta_run += 1;
            match outcome {
                Some(QuantumOutcome::Finished(_)) => s.jobs_finished += 1,
                None => s.quanta_failed += 1,
                Some(_) => {}
            }
        }
    }

    info!(worker = %name, "snapshot worker stopped");
}
