use crate::config::{ChannelKind, SyncConfig};
use crate::error::Result;
use crate::lock::SyncLock;
use crate::progress::{SilentReporter, SyncReporter};
use crate::reclaimer::{CleanupReport, RemoteStorageReclaimer, StorageReclaimer, UsageReport, UsageStatus};
use crate::remote::{LocalChannel, RemoteChannel, SshChannel};
use crate::safe_delete::SafeDeleteManager;
use crate::scanner::{self, DiscoveryReport, ScanFilter};
use crate::storage::models::FileRecord;
use crate::storage::Database;
use crate::transfer::{AtomicTransfer, TransferError};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const SLEEP_SLICE: Duration = Duration::from_secs(1);

/// What one locked sync cycle did.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub recovered: usize,
    pub discovery: DiscoveryReport,
    pub attempted: usize,
    pub transferred: usize,
    pub failed: usize,
    pub deletes_scheduled: usize,
    /// Transferred files whose local delete could not be queued.
    pub unscheduled_deletes: Vec<String>,
    pub deleted: usize,
    pub delete_failures: usize,
    pub orphaned_temps_removed: usize,
    pub storage: Option<UsageReport>,
    pub cleanup: Option<CleanupReport>,
    pub interrupted: bool,
    pub duration: Duration,
}

pub struct SyncEngine {
    config: SyncConfig,
    db: Arc<Database>,
    lock: SyncLock,
    transfer: AtomicTransfer,
    deletes: SafeDeleteManager,
    reclaimer: Box<dyn StorageReclaimer>,
    reporter: Arc<dyn SyncReporter>,
    shutdown: Arc<AtomicBool>,
}

impl SyncEngine {
    /// Open the status store and remote channel named by `config`.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let db = Database::open(&config.database.path)?;
        let channel: Arc<dyn RemoteChannel> = match config.remote.channel {
            ChannelKind::Ssh => Arc::new(SshChannel::from_config(&config.remote)),
            ChannelKind::Local => Arc::new(LocalChannel::new()),
        };
        info!("Remote archive: {} {}", channel.describe(), config.remote.base_path);
        Ok(Self::with_parts(config, db, channel))
    }

    pub fn with_parts(config: SyncConfig, db: Database, channel: Arc<dyn RemoteChannel>) -> Self {
        let db = Arc::new(db.with_hash_required(config.sync.enable_checksum));
        let transfer = AtomicTransfer::new(channel.clone(), db.clone(), config.remote.clone())
            .with_checksum(config.sync.enable_checksum, config.sync.checksum_algorithm);
        let deletes = SafeDeleteManager::new(
            channel.clone(),
            &config.local.pending_deletes_path,
            &config.sync,
            &config.remote,
        );
        let reclaimer = Box::new(RemoteStorageReclaimer::new(
            channel,
            config.remote.clone(),
            config.storage.clone(),
        ));
        Self {
            lock: SyncLock::from_config(&config.lock),
            config,
            db,
            transfer,
            deletes,
            reclaimer,
            reporter: Arc::new(SilentReporter),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn SyncReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_reclaimer(mut self, reclaimer: Box<dyn StorageReclaimer>) -> Self {
        self.reclaimer = reclaimer;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn lock(&self) -> &SyncLock {
        &self.lock
    }

    pub fn deletes(&self) -> &SafeDeleteManager {
        &self.deletes
    }

    pub fn transfer(&self) -> &AtomicTransfer {
        &self.transfer
    }

    pub fn reclaimer(&self) -> &dyn StorageReclaimer {
        self.reclaimer.as_ref()
    }

    /// Set to `true` to stop between files and end `run_periodic`. Suitable
    /// for `signal_hook::flag::register`.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Register files in the media directory without transferring them.
    pub fn discover(&self) -> Result<DiscoveryReport> {
        let filter = ScanFilter::new(
            &self.config.local.exclude_patterns,
            Duration::from_secs(self.config.local.min_file_age_secs),
        );
        let algorithm = self
            .config
            .sync
            .enable_checksum
            .then_some(self.config.sync.checksum_algorithm);
        scanner::discover(
            &self.config.local.media_path,
            &filter,
            &self.db,
            algorithm,
            self.reporter.as_ref(),
        )
    }

    /// One sync cycle under the lock. `Ok(None)` means another cycle holds it.
    pub fn run_cycle(&self) -> Result<Option<CycleReport>> {
        let wait = Duration::from_secs(self.config.lock.wait_secs);
        let _guard = match self.lock.guard(wait)? {
            Some(guard) => guard,
            None => {
                info!("Another sync cycle is in progress, skipping");
                return Ok(None);
            }
        };
        self.run_locked().map(Some)
    }

    fn run_locked(&self) -> Result<CycleReport> {
        let started = Instant::now();
        self.reporter.on_cycle_start();
        let mut report = CycleReport {
            recovered: self.db.recover_interrupted("interrupted before completion")?,
            ..CycleReport::default()
        };

        // Phase 1: Discover
        report.discovery = self.discover()?;

        // Phase 2: Transfer, oldest first
        let batch = self.next_batch()?;
        report.attempted = batch.len();
        self.reporter.on_transfer_start(batch.len());
        let transfer_start = Instant::now();
        for record in &batch {
            if self.stopping() {
                info!("Shutdown requested, stopping before {}", record.file_path);
                report.interrupted = true;
                break;
            }
            match self.transfer.transfer(record) {
                Ok(outcome) => {
                    report.transferred += 1;
                    self.reporter
                        .on_file_transferred(&outcome.local_path, outcome.bytes);
                    if self.config.sync.delete_after_sync {
                        if self.deletes.schedule(
                            Path::new(&outcome.local_path),
                            &outcome.remote_path,
                            Some(&outcome.content_hash),
                        ) {
                            report.deletes_scheduled += 1;
                        } else {
                            report.unscheduled_deletes.push(outcome.local_path.clone());
                            warn!(
                                "{} is archived at {} but its local delete could not be queued; \
                                 the local copy stays until removed by hand",
                                outcome.local_path, outcome.remote_path
                            );
                        }
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    self.reporter.on_file_failed(&record.file_path, &e.to_string());
                    if let TransferError::Store(inner) = &e {
                        error!("Status store failure during transfer: {}", inner);
                    }
                }
            }
        }
        self.reporter.on_transfer_complete(
            report.transferred,
            report.failed,
            transfer_start.elapsed().as_secs_f64(),
        );

        if self.stopping() {
            report.interrupted = true;
            report.duration = started.elapsed();
            return Ok(report);
        }

        // Phase 3: Verified deletes
        let (deleted, delete_failures) = self.deletes.process_pending();
        report.deleted = deleted;
        report.delete_failures = delete_failures;
        self.reporter.on_deletes_processed(deleted, delete_failures);

        // Phase 4: Housekeeping
        match self
            .transfer
            .cleanup_orphaned_temps(self.config.sync.temp_sweep_age_minutes)
        {
            Ok(n) => report.orphaned_temps_removed = n,
            Err(e) => warn!("Orphaned temp sweep failed: {}", e),
        }
        self.check_storage(&mut report);

        report.duration = started.elapsed();
        self.reporter.on_cycle_complete(report.duration.as_secs_f64());
        info!(
            "Sync cycle done in {:.2}s: {} transferred, {} failed, {} deleted",
            report.duration.as_secs_f64(),
            report.transferred,
            report.failed,
            report.deleted
        );
        Ok(report)
    }

    /// Ready rows first, then failed rows still under the retry budget.
    fn next_batch(&self) -> Result<Vec<FileRecord>> {
        let limit = self.config.sync.batch_size.max(1);
        let mut batch = self.db.get_ready_to_transfer()?;
        batch.truncate(limit);
        if batch.len() < limit {
            let retries = self
                .db
                .get_failed_files(i64::from(self.config.sync.max_retry_attempts))?;
            batch.extend(retries.into_iter().take(limit - batch.len()));
        }
        debug!("Selected {} files for transfer", batch.len());
        Ok(batch)
    }

    fn check_storage(&self, report: &mut CycleReport) {
        let usage = match self.reclaimer.check_usage() {
            Ok(usage) => usage,
            Err(e) => {
                warn!("Storage usage check failed: {}", e);
                return;
            }
        };
        if usage.status != UsageStatus::Normal {
            warn!(
                "Remote storage at {:.1}% ({}), triggering cleanup",
                usage.usage_percent, usage.status
            );
            match self.reclaimer.cleanup(false) {
                Ok(cleanup) => report.cleanup = Some(cleanup),
                Err(e) => warn!("Storage cleanup failed: {}", e),
            }
        }
        report.storage = Some(usage);
    }

    /// Run a cycle now and then every `interval` until stopped.
    pub fn run_periodic(&self, interval: Duration) {
        info!("Sync daemon started, interval {}s", interval.as_secs());
        while !self.stopping() {
            match self.run_cycle() {
                Ok(Some(report)) => debug!("Cycle report: {:?}", report),
                Ok(None) => {}
                Err(e) => error!("Sync cycle failed: {}", e),
            }

            let deadline = Instant::now() + interval;
            while !self.stopping() {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                thread::sleep(SLEEP_SLICE.min(deadline - now));
            }
        }
        info!("Sync daemon stopped");
    }
}
