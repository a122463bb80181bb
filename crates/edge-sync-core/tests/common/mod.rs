#![allow(dead_code)]

use edge_sync_core::config::{ChannelKind, SyncConfig};
use edge_sync_core::error::Result;
use edge_sync_core::remote::{shell_quote, CommandOutput, LocalChannel, RemoteChannel};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

pub const T: Duration = Duration::from_secs(10);

/// Failures the channel should inject.
#[derive(Default)]
pub struct Faults {
    pub fail_rename: AtomicBool,
    pub remote_missing: AtomicBool,
    pub corrupt_stream: AtomicBool,
    pub fail_exists_check: AtomicBool,
    /// Another writer fills the final name while the temp is streaming.
    pub occupy_destination: AtomicBool,
}

/// `LocalChannel` with switchable faults and a command log.
#[derive(Default)]
pub struct FaultyChannel {
    inner: LocalChannel,
    pub faults: Faults,
    pub commands: Mutex<Vec<String>>,
    pub streams: AtomicUsize,
}

impl FaultyChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, flag: &AtomicBool, on: bool) {
        flag.store(on, Ordering::SeqCst);
    }

    pub fn ran(&self, prefix: &str) -> bool {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.starts_with(prefix))
    }

    pub fn ran_containing(&self, needle: &str) -> bool {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.contains(needle))
    }

    fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

impl RemoteChannel for FaultyChannel {
    fn run_command(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        self.commands.lock().unwrap().push(command.to_string());
        if command.contains("mv -f ") && self.faults.fail_rename.load(Ordering::SeqCst) {
            return Ok(Self::failed("mv: injected rename failure"));
        }
        if command.starts_with("test -f ") {
            if self.faults.fail_exists_check.load(Ordering::SeqCst) {
                return Err(edge_sync_core::Error::Timeout {
                    command: command.to_string(),
                    after: timeout,
                });
            }
            if self.faults.remote_missing.load(Ordering::SeqCst) {
                return Ok(Self::failed(""));
            }
        }
        self.inner.run_command(command, timeout)
    }

    fn stream_to_remote_file(&self, local: &Path, remote_path: &str, timeout: Duration) -> Result<i32> {
        self.streams.fetch_add(1, Ordering::SeqCst);
        if self.faults.corrupt_stream.load(Ordering::SeqCst) {
            let out = self
                .inner
                .run_command(&format!("printf garbage > {}", shell_quote(remote_path)), timeout)?;
            return Ok(out.exit_code);
        }
        let code = self.inner.stream_to_remote_file(local, remote_path, timeout)?;
        if self.faults.occupy_destination.load(Ordering::SeqCst) {
            if let Some((dest, _)) = remote_path.rsplit_once(".tmp.") {
                fs::write(dest, b"intruder").unwrap();
            }
        }
        Ok(code)
    }

    fn describe(&self) -> String {
        "faulty-local".to_string()
    }
}

/// Workspace layout under one temp dir: `media/`, `archive/`, `run/`.
pub struct Fixture {
    pub root: PathBuf,
    pub config: SyncConfig,
}

impl Fixture {
    pub fn new(root: &Path) -> Self {
        let mut config = SyncConfig::default();
        config.remote.channel = ChannelKind::Local;
        config.remote.base_path = root.join("archive").to_string_lossy().into_owned();
        config.local.media_path = root.join("media");
        config.local.min_file_age_secs = 0;
        config.local.pending_deletes_path = root.join("run").join("pending_deletes.json");
        config.lock.lock_dir = root.join("run");
        config.database.path = root.join("run").join("media_status.db");
        config.sync.safe_delete_delay_minutes = 0;
        fs::create_dir_all(root.join("media")).unwrap();
        fs::create_dir_all(root.join("archive")).unwrap();
        Self {
            root: root.to_path_buf(),
            config,
        }
    }

    pub fn media(&self, name: &str, body: &[u8]) -> PathBuf {
        let path = self.root.join("media").join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, body).unwrap();
        path
    }

    pub fn archive(&self) -> PathBuf {
        self.root.join("archive")
    }
}

/// Every regular file under `dir`, relative to it, sorted.
pub fn list_files(dir: &Path) -> Vec<String> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(dir).into_iter().flatten() {
        if entry.file_type().is_file() {
            let rel = entry.path().strip_prefix(dir).unwrap();
            out.push(rel.to_string_lossy().into_owned());
        }
    }
    out.sort();
    out
}

pub fn backdate(path: &Path, by: Duration) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - by).unwrap();
}
