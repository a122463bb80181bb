use chrono::{Duration as ChronoDuration, Utc};
use edge_sync_core::lock::{LockRecord, SyncLock};
use fs2::FileExt;
use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

#[test]
fn test_exactly_one_of_many_acquires() {
    let dir = tempdir().unwrap();
    let contenders = 8;
    let barrier = Arc::new(Barrier::new(contenders));

    let handles: Vec<_> = (0..contenders)
        .map(|_| {
            let path = dir.path().to_path_buf();
            let barrier = barrier.clone();
            thread::spawn(move || {
                // Separate instances, as separate processes would have
                let lock = SyncLock::new(&path, "media_sync", Duration::from_secs(3600));
                barrier.wait();
                let won = lock.acquire(Duration::ZERO).unwrap();
                // Hold until everyone has tried
                barrier.wait();
                if won {
                    assert!(lock.release().unwrap());
                }
                won
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
}

#[test]
fn test_waiter_gets_lock_after_release() {
    let dir = tempdir().unwrap();
    let holder = SyncLock::new(dir.path(), "m", Duration::from_secs(3600));
    assert!(holder.acquire(Duration::ZERO).unwrap());

    let path = dir.path().to_path_buf();
    let waiter = thread::spawn(move || {
        let lock = SyncLock::new(&path, "m", Duration::from_secs(3600));
        let started = Instant::now();
        let got = lock.acquire(Duration::from_secs(5)).unwrap();
        let waited = started.elapsed();
        if got {
            lock.release().unwrap();
        }
        (got, waited)
    });

    thread::sleep(Duration::from_millis(1200));
    assert!(holder.release().unwrap());

    let (got, waited) = waiter.join().unwrap();
    assert!(got);
    assert!(waited >= Duration::from_secs(1));
}

#[test]
fn test_busy_lock_without_wait_fails_fast() {
    let dir = tempdir().unwrap();
    let holder = SyncLock::new(dir.path(), "m", Duration::from_secs(3600));
    let other = SyncLock::new(dir.path(), "m", Duration::from_secs(3600));
    assert!(holder.acquire(Duration::ZERO).unwrap());

    let started = Instant::now();
    assert!(!other.acquire(Duration::ZERO).unwrap());
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(other.is_locked().unwrap());
    assert_eq!(other.lock_info().unwrap().pid, std::process::id());
}

#[test]
fn test_stale_lock_is_recovered() {
    let dir = tempdir().unwrap();
    let lock = SyncLock::new(dir.path(), "media_sync", Duration::from_secs(60));

    // A holder that still has the flock but whose record is two hours old
    let crashed = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(lock.lock_path())
        .unwrap();
    crashed.try_lock_exclusive().unwrap();
    let record = LockRecord {
        pid: 999_999,
        thread_id: "ThreadId(1)".to_string(),
        holder: "edge-sync".to_string(),
        acquired_at: Utc::now() - ChronoDuration::hours(2),
        timeout_secs: 60,
    };
    fs::write(lock.info_path(), serde_json::to_vec(&record).unwrap()).unwrap();
    assert!(record.is_stale());

    assert!(!lock.is_locked().unwrap());
    assert!(!lock.lock_path().exists());
    assert!(!lock.info_path().exists());

    // Recreate the stale state and let a new acquirer clean it up itself
    let crashed_again = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(lock.lock_path())
        .unwrap();
    crashed_again.try_lock_exclusive().unwrap();
    fs::write(lock.info_path(), serde_json::to_vec(&record).unwrap()).unwrap();

    assert!(lock.acquire(Duration::ZERO).unwrap());
    let info = lock.lock_info().unwrap();
    assert_eq!(info.pid, std::process::id());
    assert!(!info.is_stale());
    assert!(lock.release().unwrap());
    drop(crashed);
    drop(crashed_again);
}

#[test]
fn test_force_release_clears_abandoned_holder() {
    let dir = tempdir().unwrap();
    let lock = SyncLock::new(dir.path(), "m", Duration::from_secs(3600));
    {
        let first = SyncLock::new(dir.path(), "m", Duration::from_secs(3600));
        assert!(first.acquire(Duration::ZERO).unwrap());
        // Simulate a crash: forget the instance without running Drop
        std::mem::forget(first);
    }
    // The forgotten handle still holds the flock in this process, so the
    // lock is live until the record goes stale.
    assert!(lock.is_locked().unwrap());
    assert!(!lock.acquire(Duration::ZERO).unwrap());
    lock.force_release().unwrap();
    assert!(!lock.is_locked().unwrap());
    assert!(lock.acquire(Duration::ZERO).unwrap());
}

#[test]
fn test_overdue_holder_release_keeps_new_holders_lock() {
    let dir = tempdir().unwrap();
    let timeout = Duration::from_secs(1);
    let overdue = SyncLock::new(dir.path(), "m", timeout);
    let successor = SyncLock::new(dir.path(), "m", timeout);
    let latecomer = SyncLock::new(dir.path(), "m", timeout);

    assert!(overdue.acquire(Duration::ZERO).unwrap());
    thread::sleep(Duration::from_millis(2100));

    // The successor recovers the stale lock while the overdue holder still
    // thinks it owns it
    assert!(successor.acquire(Duration::ZERO).unwrap());
    let successor_record = successor.lock_info().unwrap();

    assert!(!overdue.release().unwrap());
    assert!(successor.lock_path().exists());
    assert_eq!(successor.lock_info().unwrap(), successor_record);

    assert!(successor.is_locked().unwrap());
    assert!(!latecomer.acquire(Duration::ZERO).unwrap());

    assert!(successor.release().unwrap());
    assert!(latecomer.acquire(Duration::ZERO).unwrap());
    assert!(latecomer.release().unwrap());
}
