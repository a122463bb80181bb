mod commands;
mod logging;
mod progress;

use std::io::{self, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands};
use dotenv::dotenv;
use edge_sync_core::reclaimer::UsageStatus;
use edge_sync_core::storage::models::FileStatus;
use edge_sync_core::storage::Database;
use edge_sync_core::{SyncConfig, SyncEngine, SyncLock};
use progress::CliReporter;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{error, info, warn};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let _guard = logging::init_logger();

    let args = Cli::parse();

    let config = match edge_sync_core::config::load_configuration(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let result = match args.command {
        Some(Commands::Run) => run_once(config),
        Some(Commands::Daemon { interval }) => run_daemon(config, interval),
        Some(Commands::Discover) => run_discover(config),
        Some(Commands::Status { filter }) => show_status(&config, filter.as_deref()),
        Some(Commands::Failed) => show_failed(&config),
        Some(Commands::LockStatus) => show_lock(&config),
        Some(Commands::Unlock { yes }) => unlock(&config, yes),
        Some(Commands::PendingDeletes) => show_pending_deletes(config),
        Some(Commands::ProcessDeletes { clear_completed }) => {
            process_deletes(config, clear_completed)
        }
        Some(Commands::Storage { cleanup, force }) => storage(config, cleanup, force),
        Some(Commands::SweepTemps) => sweep_temps(config),
        Some(Commands::Prune { days }) => prune(&config, days),
        Some(Commands::PrintConfig) => {
            println!("Configuration: {:#?}", config);
            Ok(())
        }
        None => {
            let _ = Cli::command().print_long_help();
            Ok(())
        }
    };

    if let Err(err) = result {
        error!("Error: {:#}", err);
        process::exit(1);
    }
    Ok(())
}

fn open_engine(config: SyncConfig) -> anyhow::Result<SyncEngine> {
    SyncEngine::new(config).context("failed to initialise sync engine")
}

fn register_signals(engine: &SyncEngine) -> anyhow::Result<()> {
    let flag = engine.shutdown_flag();
    signal_hook::flag::register(SIGINT, flag.clone())?;
    signal_hook::flag::register(SIGTERM, flag)?;
    Ok(())
}

fn run_once(config: SyncConfig) -> anyhow::Result<()> {
    let engine = open_engine(config)?.with_reporter(Arc::new(CliReporter::new()));
    register_signals(&engine)?;

    match engine.run_cycle()? {
        Some(report) => {
            println!();
            info!(
                "Discovered {}, transferred {}, failed {}, deleted {} in {}",
                format!("{}", report.discovery.registered).cyan(),
                format!("{}", report.transferred).green(),
                format!("{}", report.failed).red(),
                format!("{}", report.deleted).green(),
                format!("{:.2}s", report.duration.as_secs_f64()).green(),
            );
            for path in &report.unscheduled_deletes {
                warn!("{} was archived but is not queued for local delete", path);
            }
            if report.recovered > 0 {
                warn!("{} interrupted transfers were recovered", report.recovered);
            }
            if let Some(storage) = report.storage {
                info!(
                    "Remote storage {} at {:.1}%",
                    colour_status(storage.status),
                    storage.usage_percent
                );
            }
            if report.interrupted {
                warn!("Cycle interrupted by shutdown request");
            }
        }
        None => warn!("Another sync is running; nothing done"),
    }
    Ok(())
}

fn run_daemon(config: SyncConfig, interval: Option<u64>) -> anyhow::Result<()> {
    let minutes = interval.unwrap_or(config.sync.interval_minutes).max(1);
    let engine = open_engine(config)?;
    register_signals(&engine)?;
    engine.run_periodic(Duration::from_secs(minutes * 60));
    Ok(())
}

fn run_discover(config: SyncConfig) -> anyhow::Result<()> {
    let engine = open_engine(config)?;
    let report = engine.discover()?;
    info!(
        "{} files seen, {} registered, {} already known, {} too recent",
        report.seen,
        format!("{}", report.registered).green(),
        report.already_known,
        report.too_recent
    );
    Ok(())
}

fn open_db(config: &SyncConfig) -> anyhow::Result<Database> {
    Database::open(&config.database.path)
        .with_context(|| format!("cannot open {}", config.database.path.display()))
}

fn show_status(config: &SyncConfig, filter: Option<&str>) -> anyhow::Result<()> {
    let db = open_db(config)?;
    match filter {
        Some(raw) => {
            let status: FileStatus = raw.parse().map_err(|e: String| anyhow!(e))?;
            let records = db.get_files_by_status(status)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        None => {
            let stats = db.get_statistics()?;
            println!("Total files:       {}", stats.total_files);
            println!("Downloaded:        {}", stats.downloaded_files);
            println!("Transferred:       {}", format!("{}", stats.transferred_files).green());
            println!("Failed:            {}", format!("{}", stats.failed_files).red());
        }
    }
    Ok(())
}

fn show_failed(config: &SyncConfig) -> anyhow::Result<()> {
    let db = open_db(config)?;
    let failed = db.get_failed_files(i64::from(config.sync.max_retry_attempts))?;
    if failed.is_empty() {
        println!("No retryable failures");
    }
    for record in failed {
        println!(
            "{} (retries {}): {}",
            record.file_path,
            record.transfer_retry_count,
            record.last_error_message.red()
        );
    }
    Ok(())
}

fn show_lock(config: &SyncConfig) -> anyhow::Result<()> {
    let lock = SyncLock::from_config(&config.lock);
    if !lock.is_locked()? {
        println!("{} is free", lock.lock_path().display());
        return Ok(());
    }
    match lock.lock_info() {
        Some(info) => println!(
            "{} held by pid {} ({}, {}) since {} ({}s ago, timeout {}s)",
            lock.lock_path().display(),
            info.pid,
            info.holder,
            info.thread_id,
            info.acquired_at,
            info.age().as_secs(),
            info.timeout_secs
        ),
        None => println!("{} is held (no owner record)", lock.lock_path().display()),
    }
    Ok(())
}

fn unlock(config: &SyncConfig, yes: bool) -> anyhow::Result<()> {
    let lock = SyncLock::from_config(&config.lock);
    if !yes
        && !prompt_confirm(
            "Force release the sync lock? A running sync may still be using it.",
            Some(false),
        )?
    {
        return Ok(());
    }
    lock.force_release()?;
    println!("Lock {} released", lock.lock_path().display());
    Ok(())
}

fn show_pending_deletes(config: SyncConfig) -> anyhow::Result<()> {
    let engine = open_engine(config)?;
    let deletes = engine.deletes();
    let summary = deletes.status_summary();
    println!(
        "{} pending ({} ready, {} waiting, {} retrying)",
        summary.total, summary.ready, summary.waiting, summary.retrying
    );
    if let Some(next) = summary.next_scheduled.and_then(epoch_to_datetime) {
        println!("Next due: {}", next);
    }
    for task in deletes.tasks_snapshot() {
        let due = epoch_to_datetime(task.scheduled_time)
            .map(|d| d.to_rfc3339())
            .unwrap_or_default();
        println!(
            "  {} -> {} (due {}, retry {}/{})",
            task.local_file_path, task.remote_file_path, due, task.retry_count, task.max_retries
        );
    }
    Ok(())
}

fn process_deletes(config: SyncConfig, clear_completed: bool) -> anyhow::Result<()> {
    let engine = open_engine(config)?;
    let wait = Duration::from_secs(engine.config().lock.wait_secs);
    let outcome = engine.lock().scoped(wait, || {
        let cleared = if clear_completed {
            engine.deletes().clear_completed_tasks()
        } else {
            0
        };
        (cleared, engine.deletes().process_pending())
    })?;
    match outcome {
        Some((cleared, (deleted, failed))) => info!(
            "{} deleted, {} deferred, {} cleared",
            format!("{}", deleted).green(),
            format!("{}", failed).red(),
            cleared
        ),
        None => warn!("Another sync is running; try again later"),
    }
    Ok(())
}

fn storage(config: SyncConfig, cleanup: bool, force: bool) -> anyhow::Result<()> {
    let engine = open_engine(config)?;
    let usage = engine.reclaimer().check_usage()?;
    println!(
        "Remote storage {}: {:.1}% used ({} of {} bytes, {} available)",
        colour_status(usage.status),
        usage.usage_percent,
        usage.used_bytes,
        usage.total_bytes,
        usage.available_bytes
    );
    if !(cleanup || force) {
        return Ok(());
    }
    let wait = Duration::from_secs(engine.config().lock.wait_secs);
    match engine.lock().scoped(wait, || engine.reclaimer().cleanup(force))? {
        Some(report) => {
            let report = report?;
            info!(
                "Cleanup removed {} files, {} failed",
                report.files_deleted, report.files_failed
            );
        }
        None => warn!("Another sync is running; cleanup skipped"),
    }
    Ok(())
}

fn sweep_temps(config: SyncConfig) -> anyhow::Result<()> {
    let engine = open_engine(config)?;
    let age = engine.config().sync.temp_sweep_age_minutes;
    let removed = engine.transfer().cleanup_orphaned_temps(age)?;
    info!("Removed {} orphaned temp objects older than {} minutes", removed, age);
    Ok(())
}

fn prune(config: &SyncConfig, days: Option<u32>) -> anyhow::Result<()> {
    let days = days.unwrap_or(config.database.retention_days);
    let db = open_db(config)?;
    let removed = db.cleanup_old_records(days)?;
    info!("Removed {} records older than {} days", removed, days);
    Ok(())
}

fn colour_status(status: UsageStatus) -> ColoredString {
    match status {
        UsageStatus::Normal => status.to_string().green(),
        UsageStatus::Warning => status.to_string().yellow(),
        UsageStatus::Critical => status.to_string().red(),
    }
}

fn epoch_to_datetime(secs: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs.trunc() as i64, (secs.fract() * 1e9) as u32)
}

fn prompt_confirm(prompt: &str, default: Option<bool>) -> io::Result<bool> {
    let mut input = String::new();

    loop {
        input.clear();

        match default {
            Some(true) => print!("{} (Y/n): ", prompt),
            Some(false) | None => print!("{} (y/N): ", prompt),
        }
        io::stdout().flush()?;

        io::stdin().read_line(&mut input)?;

        match input.trim().to_uppercase().as_str() {
            "Y" => return Ok(true),
            "N" => return Ok(false),
            "" => match default {
                Some(default) => return Ok(default),
                None => continue,
            },
            _ => continue,
        }
    }
}
