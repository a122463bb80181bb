//! Delayed, verified removal of local files after a successful transfer.
//!
//! Tasks live in a JSON file that is rewritten in full (temp file + rename)
//! whenever the queue changes. Every change re-reads the file while holding
//! an advisory lock on `<queue>.lock`, so several processes can share one
//! queue. A local file is removed only after the remote copy was found, and
//! its hash matched, in the same pass.

use crate::config::{RemoteConfig, SyncSettings};
use crate::error::Result;
use crate::hasher::{file_checksum, HashAlgorithm};
use crate::remote::RemoteChannel;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

const BACKOFF_BASE_SECS: u64 = 60;
const BACKOFF_CAP_SECS: u64 = 3600;

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteTask {
    pub local_file_path: String,
    pub remote_file_path: String,
    #[serde(default)]
    pub local_checksum: String,
    /// Epoch seconds; the task is not acted on before this.
    pub scheduled_time: f64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub created_time: f64,
}

impl DeleteTask {
    pub fn is_ready(&self, now: f64) -> bool {
        self.scheduled_time <= now
    }
}

/// Snapshot of the queue for status output.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeleteQueueSummary {
    pub total: usize,
    pub ready: usize,
    pub waiting: usize,
    pub retrying: usize,
    pub next_scheduled: Option<f64>,
    pub oldest_created: Option<f64>,
}

/// Delay before the next attempt after `retry_count` failures so far.
pub fn backoff_delay(retry_count: u32) -> Duration {
    let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    Duration::from_secs(BACKOFF_BASE_SECS.saturating_mul(factor).min(BACKOFF_CAP_SECS))
}

pub(crate) fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub struct SafeDeleteManager {
    channel: Arc<dyn RemoteChannel>,
    queue_path: PathBuf,
    delay: Duration,
    max_retries: u32,
    verify_checksum: bool,
    algorithm: HashAlgorithm,
    exists_timeout: Duration,
    hash_timeout: Duration,
    tasks: Mutex<Vec<DeleteTask>>,
}

impl SafeDeleteManager {
    pub fn new(
        channel: Arc<dyn RemoteChannel>,
        queue_path: &Path,
        settings: &SyncSettings,
        remote: &RemoteConfig,
    ) -> Self {
        let tasks = load_queue(queue_path);
        if !tasks.is_empty() {
            info!("Loaded {} pending delete tasks from {}", tasks.len(), queue_path.display());
        }
        Self {
            channel,
            queue_path: queue_path.to_path_buf(),
            delay: Duration::from_secs(settings.safe_delete_delay_minutes * 60),
            max_retries: settings.delete_max_retries,
            verify_checksum: settings.enable_checksum,
            algorithm: settings.checksum_algorithm,
            exists_timeout: remote.command_timeout(),
            hash_timeout: remote.hash_timeout(),
            tasks: Mutex::new(tasks),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue `local` for removal once the delay has passed. Returns `false`
    /// when the file is already gone or the queue could not be persisted.
    pub fn schedule(&self, local: &Path, remote_path: &str, checksum: Option<&str>) -> bool {
        if !local.exists() {
            warn!("Not scheduling delete of missing file {}", local.display());
            return false;
        }

        let local_checksum = match checksum.filter(|c| !c.is_empty()) {
            Some(c) => c.to_string(),
            None if self.verify_checksum => match file_checksum(local, self.algorithm) {
                Ok(c) => c,
                Err(e) => {
                    error!("Cannot hash {} for delete scheduling: {}", local.display(), e);
                    return false;
                }
            },
            None => String::new(),
        };

        let now = epoch_now();
        let task = DeleteTask {
            local_file_path: local.to_string_lossy().into_owned(),
            remote_file_path: remote_path.to_string(),
            local_checksum,
            scheduled_time: now + self.delay.as_secs_f64(),
            retry_count: 0,
            max_retries: self.max_retries,
            created_time: now,
        };

        let (mut tasks, _queue_lock) = match self.lock_queue() {
            Ok(locked) => locked,
            Err(e) => {
                error!("Cannot lock delete queue {}: {}", self.queue_path.display(), e);
                return false;
            }
        };
        tasks.push(task);
        if let Err(e) = save_queue(&self.queue_path, &tasks) {
            tasks.pop();
            error!("Failed to persist delete queue {}: {}", self.queue_path.display(), e);
            return false;
        }
        info!(
            "Scheduled delete of {} in {}s",
            local.display(),
            self.delay.as_secs()
        );
        true
    }

    /// Act on every task whose time has come. Returns `(deleted, failed)`
    /// where `failed` counts verification failures in this pass.
    pub fn process_pending(&self) -> (usize, usize) {
        let (mut tasks, _queue_lock) = match self.lock_queue() {
            Ok(locked) => locked,
            Err(e) => {
                error!("Cannot lock delete queue {}: {}", self.queue_path.display(), e);
                return (0, 0);
            }
        };
        let snapshot = tasks.clone();
        let now = epoch_now();

        let mut succeeded = 0;
        let mut failed = 0;
        let mut changed = false;
        let mut remaining = Vec::with_capacity(tasks.len());

        for mut task in tasks.drain(..) {
            if !task.is_ready(now) {
                remaining.push(task);
                continue;
            }
            changed = true;
            match self.execute(&task) {
                Ok(()) => succeeded += 1,
                Err(reason) => {
                    failed += 1;
                    if task.retry_count < task.max_retries {
                        let delay = backoff_delay(task.retry_count);
                        task.retry_count += 1;
                        task.scheduled_time = now + delay.as_secs_f64();
                        warn!(
                            "Delete of {} deferred ({}), retry {}/{} in {}s",
                            task.local_file_path,
                            reason,
                            task.retry_count,
                            task.max_retries,
                            delay.as_secs()
                        );
                        remaining.push(task);
                    } else {
                        error!(
                            "Giving up on delete of {} after {} retries: {}",
                            task.local_file_path, task.retry_count, reason
                        );
                    }
                }
            }
        }
        *tasks = remaining;

        if changed {
            if let Err(e) = save_queue(&self.queue_path, &tasks) {
                error!("Failed to persist delete queue {}: {}", self.queue_path.display(), e);
                *tasks = snapshot;
            }
        }
        if succeeded > 0 || failed > 0 {
            info!("Delete pass: {} deleted, {} failed", succeeded, failed);
        }
        (succeeded, failed)
    }

    fn execute(&self, task: &DeleteTask) -> std::result::Result<(), String> {
        let local = Path::new(&task.local_file_path);
        if !local.exists() {
            info!("{} already removed", task.local_file_path);
            return Ok(());
        }

        match self
            .channel
            .remote_file_exists(&task.remote_file_path, self.exists_timeout)
        {
            Ok(true) => {}
            Ok(false) => return Err(format!("remote copy {} missing", task.remote_file_path)),
            Err(e) => return Err(format!("remote existence check failed: {}", e)),
        }

        if self.verify_checksum {
            let expected = if task.local_checksum.is_empty() {
                file_checksum(local, self.algorithm)
                    .map_err(|e| format!("cannot hash local file: {}", e))?
            } else {
                task.local_checksum.clone()
            };
            let actual = self
                .channel
                .remote_file_hash(&task.remote_file_path, self.algorithm, self.hash_timeout)
                .map_err(|e| format!("remote hash failed: {}", e))?;
            if actual != expected {
                return Err(format!(
                    "checksum mismatch: expected {}, remote {}",
                    expected, actual
                ));
            }
        }

        match fs::remove_file(local) {
            Ok(()) => {
                info!("Deleted local file {} (verified at {})", task.local_file_path, task.remote_file_path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(format!("local delete failed: {}", e)),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.reloaded().len()
    }

    pub fn ready_count(&self) -> usize {
        let now = epoch_now();
        self.reloaded().iter().filter(|t| t.is_ready(now)).count()
    }

    /// Drop tasks whose local file no longer exists.
    pub fn clear_completed_tasks(&self) -> usize {
        let (mut tasks, _queue_lock) = match self.lock_queue() {
            Ok(locked) => locked,
            Err(e) => {
                error!("Cannot lock delete queue {}: {}", self.queue_path.display(), e);
                return 0;
            }
        };
        let before = tasks.len();
        let snapshot = tasks.clone();
        tasks.retain(|t| Path::new(&t.local_file_path).exists());
        let cleared = before - tasks.len();
        if cleared > 0 {
            if let Err(e) = save_queue(&self.queue_path, &tasks) {
                error!("Failed to persist delete queue {}: {}", self.queue_path.display(), e);
                *tasks = snapshot;
                return 0;
            }
            info!("Cleared {} completed delete tasks", cleared);
        }
        cleared
    }

    pub fn status_summary(&self) -> DeleteQueueSummary {
        let now = epoch_now();
        let tasks = self.reloaded();
        let ready = tasks.iter().filter(|t| t.is_ready(now)).count();
        DeleteQueueSummary {
            total: tasks.len(),
            ready,
            waiting: tasks.len() - ready,
            retrying: tasks.iter().filter(|t| t.retry_count > 0).count(),
            next_scheduled: tasks
                .iter()
                .map(|t| t.scheduled_time)
                .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.min(t)))),
            oldest_created: tasks
                .iter()
                .map(|t| t.created_time)
                .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.min(t)))),
        }
    }

    pub fn tasks_snapshot(&self) -> Vec<DeleteTask> {
        self.reloaded().clone()
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<DeleteTask>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The queue as currently persisted, for read-only use.
    fn reloaded(&self) -> MutexGuard<'_, Vec<DeleteTask>> {
        let mut tasks = self.tasks();
        *tasks = load_queue(&self.queue_path);
        tasks
    }

    /// Take the queue for a read-modify-write: the in-process mutex, then the
    /// cross-process file lock, then a fresh read of the file. The lock is
    /// released when the returned `File` is dropped.
    fn lock_queue(&self) -> io::Result<(MutexGuard<'_, Vec<DeleteTask>>, File)> {
        let mut tasks = self.tasks();
        let lock_file = open_queue_lock(&self.queue_path)?;
        lock_file.lock_exclusive()?;
        *tasks = load_queue(&self.queue_path);
        Ok((tasks, lock_file))
    }
}

fn open_queue_lock(queue_path: &Path) -> io::Result<File> {
    if let Some(parent) = queue_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut path = queue_path.as_os_str().to_owned();
    path.push(".lock");
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(PathBuf::from(path))
}

/// An absent or unreadable queue is an empty queue.
fn load_queue(path: &Path) -> Vec<DeleteTask> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!("Cannot read delete queue {}: {}", path.display(), e);
            return Vec::new();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(tasks) => tasks,
        Err(e) => {
            warn!("Ignoring corrupt delete queue {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

fn save_queue(path: &Path, tasks: &[DeleteTask]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, serde_json::to_vec_pretty(tasks)?)?;
    fs::rename(&tmp, path)?;
    debug!("Persisted {} delete tasks to {}", tasks.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let delays: Vec<u64> = (0..8).map(|n| backoff_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![60, 120, 240, 480, 960, 1920, 3600, 3600]);
        assert_eq!(backoff_delay(200).as_secs(), 3600);
    }

    #[test]
    fn test_missing_or_corrupt_queue_loads_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pending_deletes.json");
        assert!(load_queue(&path).is_empty());
        fs::write(&path, b"[{\"local_file_path\": ").unwrap();
        assert!(load_queue(&path).is_empty());
    }

    #[test]
    fn test_queue_file_defaults_optional_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.json");
        fs::write(
            &path,
            r#"[{"local_file_path":"/a","remote_file_path":"/r/a","scheduled_time":1.5,"created_time":1.0}]"#,
        )
        .unwrap();
        let tasks = load_queue(&path);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].max_retries, 3);
        assert_eq!(tasks[0].retry_count, 0);
        assert!(tasks[0].local_checksum.is_empty());
    }

    #[test]
    fn test_save_replaces_whole_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("q.json");
        let task = DeleteTask {
            local_file_path: "/a".into(),
            remote_file_path: "/r/a".into(),
            local_checksum: String::new(),
            scheduled_time: 10.0,
            retry_count: 0,
            max_retries: 3,
            created_time: 5.0,
        };
        save_queue(&path, &[task.clone(), task.clone()]).unwrap();
        save_queue(&path, &[task.clone()]).unwrap();
        assert_eq!(load_queue(&path), vec![task]);
        assert!(!dir.path().join("nested").join("q.json.tmp").exists());
    }
}
