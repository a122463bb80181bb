use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "edge-sync")]
#[command(about = "Move edge-device media to the archive, deleting local copies only once verified", long_about = None)]
pub struct Cli {
    /// Config file (defaults to ./EdgeSync.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run one sync cycle
    Run,
    /// Run sync cycles periodically until interrupted
    Daemon {
        /// Minutes between cycles (defaults to sync.interval_minutes)
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// Register new media files without transferring them
    Discover,
    /// Show transfer statistics, or the files in one status
    Status {
        /// pending, downloading (transferring), completed (transferred) or failed
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// List failed transfers still under the retry budget
    Failed,
    /// Show who holds the sync lock
    LockStatus,
    /// Remove the sync lock regardless of holder
    Unlock {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Show the pending local delete queue
    PendingDeletes,
    /// Process due delete tasks now
    ProcessDeletes {
        /// Also drop tasks whose local file is already gone
        #[arg(long)]
        clear_completed: bool,
    },
    /// Check remote storage usage, optionally reclaiming space
    Storage {
        /// Apply cleanup rules if usage is above the warning threshold
        #[arg(long)]
        cleanup: bool,
        /// Apply cleanup rules regardless of usage
        #[arg(long)]
        force: bool,
    },
    /// Remove orphaned remote temp objects older than the configured age
    SweepTemps,
    /// Delete status records older than N days
    Prune {
        /// Defaults to database.retention_days
        #[arg(short, long)]
        days: Option<u32>,
    },
    /// Print configuration values
    PrintConfig,
}
