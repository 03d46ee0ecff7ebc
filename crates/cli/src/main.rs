use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod render;

/// Generate and compare course enrollment snapshots.
#[derive(Parser, Debug)]
#[command(name = "enrollsnap", version)]
pub struct Args {
    /// JSON description of the enrollment universe (courses, users, enrollments).
    #[arg(long, global = true)]
    pub universe: Option<PathBuf>,

    /// Snapshot store directory (overrides ENROLLSNAP_DATA_DIR).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Start a snapshot in the background.
    Start {
        name: Option<String>,
        /// Answer from the enrollment cache instead of recalculating.
        #[arg(long)]
        trust_cache: bool,
    },
    /// Generate (or resume) a snapshot in the foreground.
    Process {
        name: Option<String>,
        #[arg(long)]
        trust_cache: bool,
    },
    /// Run a single background quantum.
    Tick,
    /// Drive the active snapshot with the background worker until it ends.
    Worker,
    /// Show the snapshot being generated.
    Status,
    /// List completed snapshots.
    List {
        #[arg(long)]
        only_valid: bool,
    },
    /// Show a completed snapshot.
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Delete a completed snapshot.
    Delete { id: String },
    /// Compare two completed snapshots.
    Diff {
        a: String,
        b: String,
        /// Only show courses with differences.
        #[arg(long)]
        diff_only: bool,
        #[arg(long)]
        json: bool,
    },
    /// Release a foreground claim so background ticks may continue.
    Unlock,
    /// Check that the enrollment environment can produce snapshots.
    Check,
}

fn main() -> anyhow::Result<()> {
    enrollsnap_observability::init();

    let args = Args::parse();
    let stdout = std::io::stdout();
    commands::run(args, &mut stdout.lock())
}
