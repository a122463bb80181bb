//! Cross-process "one sync cycle in flight" lock.
//!
//! An OS advisory lock (`flock` via `fs2`) on `<dir>/<name>.lock` plus a JSON
//! sidecar `<dir>/<name>.lock.info` describing the holder. A holder whose
//! record is older than the configured timeout is presumed dead and its files
//! are removed by whoever notices first.

use crate::config::LockConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Ownership record written beside the lock file while it is held.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub thread_id: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub timeout_secs: u64,
}

impl LockRecord {
    pub fn age(&self) -> Duration {
        (Utc::now() - self.acquired_at).to_std().unwrap_or_default()
    }

    pub fn is_stale(&self) -> bool {
        self.age() > Duration::from_secs(self.timeout_secs)
    }
}

struct Held {
    file: File,
    owner: ThreadId,
    record: LockRecord,
}

pub struct SyncLock {
    lock_path: PathBuf,
    info_path: PathBuf,
    timeout: Duration,
    held: Mutex<Option<Held>>,
}

impl SyncLock {
    pub fn new(dir: &Path, name: &str, timeout: Duration) -> Self {
        Self {
            lock_path: dir.join(format!("{}.lock", name)),
            info_path: dir.join(format!("{}.lock.info", name)),
            timeout,
            held: Mutex::new(None),
        }
    }

    pub fn from_config(config: &LockConfig) -> Self {
        Self::new(
            &config.lock_dir,
            &config.name,
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn info_path(&self) -> &Path {
        &self.info_path
    }

    /// Try to take the lock, polling once a second for up to `wait`.
    /// A zero `wait` gives up at the first contention.
    pub fn acquire(&self, wait: Duration) -> Result<bool> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let deadline = Instant::now() + wait;
        loop {
            if self.try_acquire()? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!("Lock {} busy, giving up", self.lock_path.display());
                return Ok(false);
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    fn try_acquire(&self) -> Result<bool> {
        let mut held = self.held();
        if held.is_some() {
            warn!("Lock {} is already held by this instance", self.lock_path.display());
            return Ok(false);
        }

        // One extra round for a stale lock we just cleared, or a lock file
        // that was replaced under us between open and flock.
        for _ in 0..2 {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&self.lock_path)?;

            if file.try_lock_exclusive().is_err() {
                if self.cleanup_if_stale()? {
                    continue;
                }
                return Ok(false);
            }

            if !same_file(&file, &self.lock_path) {
                debug!("Lock file {} replaced while locking", self.lock_path.display());
                let _ = file.unlock();
                continue;
            }

            let record = match self.write_record(&file) {
                Ok(record) => record,
                Err(e) => {
                    let _ = fs::remove_file(&self.info_path);
                    let _ = file.unlock();
                    return Err(Error::Lock(format!(
                        "failed to record lock owner in {}: {}",
                        self.info_path.display(),
                        e
                    )));
                }
            };

            *held = Some(Held {
                file,
                owner: thread::current().id(),
                record,
            });
            info!("Acquired lock {}", self.lock_path.display());
            return Ok(true);
        }
        Ok(false)
    }

    /// Release a lock held by the calling thread. Returns `false` if this
    /// instance does not hold it, another thread acquired it, or the lock was
    /// recovered as stale and now belongs to someone else. In the last case
    /// the new holder's files are left alone.
    pub fn release(&self) -> Result<bool> {
        let mut held = self.held();
        match held.as_ref() {
            None => {
                debug!("Release of {} requested but lock not held", self.lock_path.display());
                return Ok(false);
            }
            Some(h) if h.owner != thread::current().id() => {
                warn!(
                    "Refusing to release {}: held by another thread",
                    self.lock_path.display()
                );
                return Ok(false);
            }
            Some(_) => {}
        }

        let Some(h) = held.take() else {
            return Ok(false);
        };
        if !self.still_ours(&h) {
            warn!(
                "Lock {} was taken over after going stale; leaving the new holder's files",
                self.lock_path.display()
            );
            let _ = h.file.unlock();
            return Ok(false);
        }
        // Unlink before unlocking so a waiter can never lock a path we
        // are about to delete.
        remove_if_present(&self.info_path)?;
        remove_if_present(&self.lock_path)?;
        let _ = h.file.unlock();
        info!("Released lock {}", self.lock_path.display());
        Ok(true)
    }

    /// The lock path is still the file we locked and the sidecar still
    /// names us.
    fn still_ours(&self, held: &Held) -> bool {
        same_file(&held.file, &self.lock_path) && self.lock_info().as_ref() == Some(&held.record)
    }

    /// `true` if a live holder exists. Stale locks are cleaned up and
    /// reported as free.
    pub fn is_locked(&self) -> Result<bool> {
        if !self.lock_path.exists() {
            return Ok(false);
        }
        if self.cleanup_if_stale()? {
            return Ok(false);
        }
        if self.held().is_some() {
            return Ok(true);
        }
        // A holder that exited without cleaning up no longer owns the flock.
        match OpenOptions::new().write(true).open(&self.lock_path) {
            Ok(handle) => {
                if handle.try_lock_exclusive().is_ok() {
                    let _ = handle.unlock();
                    return Ok(false);
                }
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the lock and its record unconditionally. Operator use only.
    pub fn force_release(&self) -> Result<()> {
        warn!("Force releasing lock {}", self.lock_path.display());
        if let Some(h) = self.held().take() {
            let _ = h.file.unlock();
        }
        remove_if_present(&self.info_path)?;
        remove_if_present(&self.lock_path)?;
        Ok(())
    }

    pub fn lock_info(&self) -> Option<LockRecord> {
        let raw = fs::read_to_string(&self.info_path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Acquire and return a guard that releases on drop, or `None` if busy.
    pub fn guard(&self, wait: Duration) -> Result<Option<SyncLockGuard<'_>>> {
        if self.acquire(wait)? {
            Ok(Some(SyncLockGuard { lock: self }))
        } else {
            Ok(None)
        }
    }

    /// Run `f` only if the lock could be taken; release on every exit path.
    pub fn scoped<T, F: FnOnce() -> T>(&self, wait: Duration, f: F) -> Result<Option<T>> {
        match self.guard(wait)? {
            Some(_guard) => Ok(Some(f())),
            None => Ok(None),
        }
    }

    fn held(&self) -> MutexGuard<'_, Option<Held>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_record(&self, mut file: &File) -> io::Result<LockRecord> {
        let record = LockRecord {
            pid: std::process::id(),
            thread_id: format!("{:?}", thread::current().id()),
            holder: process_name(),
            acquired_at: Utc::now(),
            timeout_secs: self.timeout.as_secs(),
        };

        // The lock file body is informational; it also refreshes the mtime
        // used when the record is unreadable.
        file.set_len(0)?;
        writeln!(file, "{}", record.pid)?;

        let tmp = self.info_path.with_extension("info.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&record)?)?;
        fs::rename(&tmp, &self.info_path)?;
        Ok(record)
    }

    /// Age of the current holder: the record's timestamp, else the lock
    /// file's mtime.
    fn holder_age(&self) -> Option<Duration> {
        if let Some(record) = self.lock_info() {
            return Some(record.age());
        }
        let modified = fs::metadata(&self.lock_path).ok()?.modified().ok()?;
        Some(SystemTime::now().duration_since(modified).unwrap_or_default())
    }

    fn cleanup_if_stale(&self) -> Result<bool> {
        let age = match self.holder_age() {
            Some(age) => age,
            None => return Ok(false),
        };
        if age <= self.timeout {
            return Ok(false);
        }
        warn!(
            "Removing stale lock {} (held for {}s, timeout {}s)",
            self.lock_path.display(),
            age.as_secs(),
            self.timeout.as_secs()
        );
        remove_if_present(&self.lock_path)?;
        remove_if_present(&self.info_path)?;
        Ok(true)
    }
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        if self.held().is_some() {
            let _ = self.release();
        }
    }
}

/// Releases the lock when dropped.
pub struct SyncLockGuard<'a> {
    lock: &'a SyncLock,
}

impl Drop for SyncLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            warn!("Failed to release lock {}: {}", self.lock.lock_path.display(), e);
        }
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), fs::metadata(path)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> bool {
    path.exists()
}
