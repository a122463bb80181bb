mod common;

use common::{list_files, FaultyChannel, Fixture};
use edge_sync_core::error::Result;
use edge_sync_core::reclaimer::{CleanupReport, StorageReclaimer, UsageReport, UsageStatus};
use edge_sync_core::storage::models::FileStatus;
use edge_sync_core::storage::Database;
use edge_sync_core::{SyncEngine, SyncLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

/// Reports a fixed usage and counts cleanup requests.
struct FixedUsage {
    status: UsageStatus,
    cleanups: Arc<AtomicUsize>,
}

impl StorageReclaimer for FixedUsage {
    fn check_usage(&self) -> Result<UsageReport> {
        Ok(UsageReport {
            status: self.status,
            usage_percent: match self.status {
                UsageStatus::Normal => 40.0,
                UsageStatus::Warning => 85.0,
                UsageStatus::Critical => 95.0,
            },
            total_bytes: 100,
            used_bytes: 0,
            available_bytes: 100,
        })
    }

    fn cleanup(&self, _force: bool) -> Result<CleanupReport> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(CleanupReport {
            files_deleted: 2,
            files_failed: 0,
        })
    }
}

fn engine(fixture: &Fixture, channel: Arc<FaultyChannel>, status: UsageStatus) -> (SyncEngine, Arc<AtomicUsize>) {
    let cleanups = Arc::new(AtomicUsize::new(0));
    let db = Database::open(&fixture.config.database.path).unwrap();
    let engine = SyncEngine::with_parts(fixture.config.clone(), db, channel).with_reclaimer(Box::new(FixedUsage {
        status,
        cleanups: cleanups.clone(),
    }));
    (engine, cleanups)
}

#[test]
fn test_cycle_transfers_verifies_and_deletes() {
    let dir = tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    let a = fixture.media("20230815_100000.mp4", b"first clip");
    let b = fixture.media("20230816_090000.jpg", b"second still");
    fixture.media(".hidden", b"ignored");
    fixture.media("upload.tmp", b"ignored");

    let (engine, cleanups) = engine(&fixture, Arc::new(FaultyChannel::new()), UsageStatus::Normal);
    let report = engine.run_cycle().unwrap().unwrap();

    assert_eq!(report.discovery.registered, 2);
    assert_eq!(report.transferred, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(report.deletes_scheduled, 2);
    assert_eq!(report.deleted, 2);
    assert!(!report.interrupted);
    assert_eq!(cleanups.load(Ordering::SeqCst), 0);

    assert_eq!(
        list_files(&fixture.archive()),
        vec!["2023/08/15/20230815_100000.mp4", "2023/08/16/20230816_090000.jpg"]
    );
    assert!(!a.exists());
    assert!(!b.exists());

    let stats = engine.database().get_statistics().unwrap();
    assert_eq!(stats.transferred_files, 2);
    // The cycle released the lock
    assert!(!engine.lock().is_locked().unwrap());
}

#[test]
fn test_failed_transfer_keeps_local_file_and_retries_next_cycle() {
    let dir = tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    let local = fixture.media("20230815_100000.mp4", b"clip");
    let channel = Arc::new(FaultyChannel::new());
    channel.set(&channel.faults.fail_rename, true);

    let (engine, _) = engine(&fixture, channel.clone(), UsageStatus::Normal);
    let report = engine.run_cycle().unwrap().unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.deletes_scheduled, 0);
    assert!(local.exists());
    assert!(list_files(&fixture.archive()).is_empty());

    channel.set(&channel.faults.fail_rename, false);
    let report = engine.run_cycle().unwrap().unwrap();
    assert_eq!(report.transferred, 1);
    let record = engine
        .database()
        .get_file_record(&local.to_string_lossy())
        .unwrap()
        .unwrap();
    assert_eq!(record.transfer_status, FileStatus::Completed);
    assert_eq!(record.transfer_retry_count, 1);
    assert!(!local.exists());
}

#[test]
fn test_cycle_skips_when_lock_is_held() {
    let dir = tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    let local = fixture.media("a.mp4", b"a");

    let other = SyncLock::from_config(&fixture.config.lock);
    assert!(other.acquire(Duration::ZERO).unwrap());

    let (engine, _) = engine(&fixture, Arc::new(FaultyChannel::new()), UsageStatus::Normal);
    assert!(engine.run_cycle().unwrap().is_none());
    assert!(local.exists());
    assert!(engine.database().get_all_files().unwrap().is_empty());
    other.release().unwrap();
}

#[test]
fn test_interrupted_rows_are_recovered_under_lock() {
    let dir = tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    let local = fixture.media("a.mp4", b"a");
    let path = local.to_string_lossy().into_owned();
    {
        let db = Database::open(&fixture.config.database.path).unwrap();
        db.insert_file_record(&path, "a.mp4", 1, "", FileStatus::Completed, FileStatus::Pending)
            .unwrap();
        db.update_transfer_status(&path, FileStatus::Downloading, "")
            .unwrap();
    }

    let (engine, _) = engine(&fixture, Arc::new(FaultyChannel::new()), UsageStatus::Normal);
    let report = engine.run_cycle().unwrap().unwrap();
    assert_eq!(report.recovered, 1);
    // Recovered as failed, then picked up as a retry in the same cycle
    assert_eq!(report.transferred, 1);
    let record = engine.database().get_file_record(&path).unwrap().unwrap();
    assert_eq!(record.transfer_status, FileStatus::Completed);
    assert_eq!(record.transfer_retry_count, 1);
}

#[test]
fn test_storage_pressure_triggers_cleanup() {
    let dir = tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    let (engine, cleanups) = engine(&fixture, Arc::new(FaultyChannel::new()), UsageStatus::Critical);
    let report = engine.run_cycle().unwrap().unwrap();
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(report.cleanup.unwrap().files_deleted, 2);
    assert_eq!(report.storage.unwrap().status, UsageStatus::Critical);
}

#[test]
fn test_stop_interrupts_between_files() {
    let dir = tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    fixture.media("a.mp4", b"a");
    fixture.media("b.mp4", b"b");

    let (engine, _) = engine(&fixture, Arc::new(FaultyChannel::new()), UsageStatus::Normal);
    engine.stop();
    let report = engine.run_cycle().unwrap().unwrap();
    assert!(report.interrupted);
    assert_eq!(report.transferred, 0);
    assert_eq!(report.discovery.registered, 2);

    // run_periodic returns at once when already stopped
    engine.run_periodic(Duration::from_secs(3600));
}

#[test]
fn test_same_named_files_survive_successive_cycles() {
    let dir = tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    let (engine, _) = engine(&fixture, Arc::new(FaultyChannel::new()), UsageStatus::Normal);

    let first = fixture.media("100MEDIA/DJI_0001.JPG", b"first photo");
    let report = engine.run_cycle().unwrap().unwrap();
    assert_eq!(report.deleted, 1);
    assert!(!first.exists());

    let second = fixture.media("101MEDIA/DJI_0001.JPG", b"second photo");
    let report = engine.run_cycle().unwrap().unwrap();
    assert_eq!(report.transferred, 1);
    assert_eq!(report.deleted, 1);
    assert!(!second.exists());

    let mut bodies: Vec<Vec<u8>> = list_files(&fixture.archive())
        .iter()
        .map(|rel| std::fs::read(fixture.archive().join(rel)).unwrap())
        .collect();
    bodies.sort();
    assert_eq!(bodies, vec![b"first photo".to_vec(), b"second photo".to_vec()]);
}

#[test]
fn test_unqueued_delete_is_reported() {
    let dir = tempdir().unwrap();
    let mut fixture = Fixture::new(dir.path());
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"").unwrap();
    fixture.config.local.pending_deletes_path = blocker.join("pending_deletes.json");
    let local = fixture.media("20230815_100000.mp4", b"clip");

    let (engine, _) = engine(&fixture, Arc::new(FaultyChannel::new()), UsageStatus::Normal);
    let report = engine.run_cycle().unwrap().unwrap();
    assert_eq!(report.transferred, 1);
    assert_eq!(report.deletes_scheduled, 0);
    assert_eq!(
        report.unscheduled_deletes,
        vec![local.to_string_lossy().into_owned()]
    );
    assert!(local.exists());
}
