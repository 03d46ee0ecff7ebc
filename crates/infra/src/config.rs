//! Engine configuration loaded from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Scheduler and storage settings.
///
/// Every field has a default; environment variables override them:
///
/// | variable | field | default |
/// |---|---|---|
/// | `ENROLLSNAP_DATA_DIR` | `data_dir` | `./.enrollsnap` |
/// | `ENROLLSNAP_FOREGROUND_BUDGET` | `foreground_budget` | 50 |
/// | `ENROLLSNAP_BACKGROUND_BUDGET` | `background_budget` | 25 |
/// | `ENROLLSNAP_LEGACY_BACKGROUND_BUDGET` | `legacy_background_budget` | 50 |
/// | `ENROLLSNAP_COURSES_PER_PAGE` | `courses_per_page` | 10 |
/// | `ENROLLSNAP_WORKER_POLL_MS` | `worker_poll_interval` | 250ms |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Root directory of the filesystem snapshot store.
    pub data_dir: PathBuf,
    /// Units resolved per quantum when a foreground driver owns the job.
    pub foreground_budget: u64,
    /// Units resolved per background quantum.
    pub background_budget: u64,
    /// Units resolved per background quantum on legacy environments.
    pub legacy_background_budget: u64,
    /// Courses fetched per directory page.
    pub courses_per_page: usize,
    /// How often the background worker checks for a pending wakeup.
    pub worker_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".enrollsnap"),
            foreground_budget: 50,
            background_budget: 25,
            legacy_background_budget: 50,
            courses_per_page: 10,
            worker_poll_interval: Duration::from_millis(250),
        }
    }
}

impl EngineConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            data_dir: lookup("ENROLLSNAP_DATA_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            foreground_budget: parse_or(&lookup, "ENROLLSNAP_FOREGROUND_BUDGET", defaults.foreground_budget),
            background_budget: parse_or(&lookup, "ENROLLSNAP_BACKGROUND_BUDGET", defaults.background_budget),
            legacy_background_budget: parse_or(
                &lookup,
                "ENROLLSNAP_LEGACY_BACKGROUND_BUDGET",
                defaults.legacy_background_budget,
            ),
            courses_per_page: parse_or(&lookup, "ENROLLSNAP_COURSES_PER_PAGE", defaults.courses_per_page)
                .max(1),
            worker_poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "ENROLLSNAP_WORKER_POLL_MS",
                defaults.worker_poll_interval.as_millis() as u64,
            )),
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_foreground_budget(mut self, budget: u64) -> Self {
        self.foreground_budget = budget;
        self
    }

    /// Set both background budgets (modern and legacy) at once.
    pub fn with_background_budget(mut self, budget: u64) -> Self {
        self.background_budget = budget;
        self.legacy_background_budget = budget;
        self
    }

    pub fn with_courses_per_page(mut self, per_page: usize) -> Self {
        self.courses_per_page = per_page.max(1);
        self
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy + core::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, default = %default, "invalid config value; using default");
                default
            }
        },
    }
}
