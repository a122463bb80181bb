use crate::config::RemoteConfig;
use crate::error::Error;
use crate::hasher::{file_checksum, HashAlgorithm};
use crate::remote::{shell_quote, RemoteChannel};
use crate::storage::models::{FileRecord, FileStatus};
use crate::storage::Database;
use chrono::{NaiveDate, Utc};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error as ThisError;
use tracing::{debug, error, info, warn};

/// Why a single-file transfer stopped. Each variant names the step that failed.
#[derive(ThisError, Debug)]
pub enum TransferError {
    #[error("transfer of {path} not started: status store refused the downloading transition")]
    NotStarted { path: String },

    #[error("cannot read local file {path}: {source}")]
    LocalRead { path: String, source: io::Error },

    #[error("failed to create remote directory {dir}: {source}")]
    RemoteDir { dir: String, source: Error },

    #[error("failed to stream {path} to {temp}: {reason}")]
    Stream {
        path: String,
        temp: String,
        reason: String,
    },

    #[error("failed to hash remote object {temp}: {source}")]
    RemoteHash { temp: String, source: Error },

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("cannot inspect remote destination {dest}: {source}")]
    Destination { dest: String, source: Error },

    #[error("no free archive name for {name} in {dir} after {attempts} attempts")]
    NamesExhausted {
        dir: String,
        name: String,
        attempts: u32,
    },

    #[error("failed to rename {temp} to {dest}: {source}")]
    Commit {
        temp: String,
        dest: String,
        source: Error,
    },

    #[error("destination {dest} appeared before commit; {temp} left uncommitted")]
    DestinationTaken { temp: String, dest: String },

    #[error("remote copy of {path} committed but completion was not recorded")]
    NotRecorded { path: String },

    #[error(transparent)]
    Store(#[from] Error),
}

/// Numbered names tried for a file before giving up: `a.jpg`, `a_1.jpg`, ...
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Where a file's bytes go in the archive.
enum Destination {
    /// Nothing there yet.
    Free(String),
    /// Already holds identical content, e.g. from a run that crashed
    /// between rename and recording completion.
    Archived(String),
}

/// A file that reached its final remote path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub local_path: String,
    pub remote_path: String,
    pub content_hash: String,
    pub bytes: u64,
}

/// Temp-write, verify, rename. A crash before the rename leaves only a
/// `*.tmp.<millis>` object behind; the final path is either absent or complete.
pub struct AtomicTransfer {
    channel: Arc<dyn RemoteChannel>,
    db: Arc<Database>,
    remote: RemoteConfig,
    verify_checksum: bool,
    algorithm: HashAlgorithm,
}

impl AtomicTransfer {
    pub fn new(channel: Arc<dyn RemoteChannel>, db: Arc<Database>, remote: RemoteConfig) -> Self {
        Self {
            channel,
            db,
            remote,
            verify_checksum: true,
            algorithm: HashAlgorithm::default(),
        }
    }

    pub fn with_checksum(mut self, enabled: bool, algorithm: HashAlgorithm) -> Self {
        self.verify_checksum = enabled;
        self.algorithm = algorithm;
        self
    }

    /// Move one registered file to the archive, driving its row through
    /// `downloading` to `completed` or `failed`.
    pub fn transfer(&self, record: &FileRecord) -> Result<TransferOutcome, TransferError> {
        let path = record.file_path.as_str();
        if !self
            .db
            .update_transfer_status(path, FileStatus::Downloading, "")?
        {
            return Err(TransferError::NotStarted {
                path: path.to_string(),
            });
        }

        let started = Instant::now();
        let mut temp_slot: Option<String> = None;
        let result = self.run_steps(record, &mut temp_slot);

        if let Some(temp) = temp_slot {
            if let Err(e) = self
                .channel
                .remove_file(&temp, self.remote.command_timeout())
            {
                warn!("Could not remove dangling temp object {}: {}", temp, e);
            }
        }

        match result {
            Ok(outcome) => {
                if self
                    .db
                    .update_transfer_status(path, FileStatus::Completed, "")?
                {
                    info!(
                        "Transferred {} -> {} ({} bytes in {:.2}s)",
                        path,
                        outcome.remote_path,
                        outcome.bytes,
                        started.elapsed().as_secs_f64()
                    );
                    Ok(outcome)
                } else {
                    let err = TransferError::NotRecorded {
                        path: path.to_string(),
                    };
                    self.mark_failed(path, &err);
                    Err(err)
                }
            }
            Err(err) => {
                error!("Transfer of {} failed: {}", path, err);
                self.mark_failed(path, &err);
                Err(err)
            }
        }
    }

    fn mark_failed(&self, path: &str, err: &TransferError) {
        match self
            .db
            .update_transfer_status(path, FileStatus::Failed, &err.to_string())
        {
            Ok(true) => {}
            Ok(false) => warn!("Could not mark {} as failed", path),
            Err(e) => error!("Could not record failure for {}: {}", path, e),
        }
    }

    fn run_steps(
        &self,
        record: &FileRecord,
        temp_slot: &mut Option<String>,
    ) -> Result<TransferOutcome, TransferError> {
        let local = Path::new(&record.file_path);
        let bytes = fs::metadata(local)
            .map_err(|source| TransferError::LocalRead {
                path: record.file_path.clone(),
                source,
            })?
            .len();

        // Step 2: local hash
        let content_hash = self.local_hash(record)?;

        // Step 3: destination directory, every time
        let dir = self.remote_dir_for(&record.file_name);
        self.channel
            .create_dir_all(&dir, self.remote.command_timeout())
            .map_err(|source| TransferError::RemoteDir {
                dir: dir.clone(),
                source,
            })?;

        let dest = match self.choose_destination(&dir, &record.file_name, &content_hash)? {
            Destination::Free(dest) => dest,
            Destination::Archived(dest) => {
                info!("{} already archived as {}", record.file_path, dest);
                return Ok(TransferOutcome {
                    local_path: record.file_path.clone(),
                    remote_path: dest,
                    content_hash,
                    bytes,
                });
            }
        };

        // Step 4: stream to a temp name
        let temp = temp_name(&dest, Utc::now().timestamp_millis());
        *temp_slot = Some(temp.clone());
        debug!("Streaming {} -> {}", record.file_path, temp);
        let code = self
            .channel
            .stream_to_remote_file(local, &temp, self.remote.stream_timeout())
            .map_err(|e| TransferError::Stream {
                path: record.file_path.clone(),
                temp: temp.clone(),
                reason: e.to_string(),
            })?;
        if code != 0 {
            return Err(TransferError::Stream {
                path: record.file_path.clone(),
                temp,
                reason: format!("remote writer exited with {}", code),
            });
        }

        // Step 5: verify the temp object
        if self.verify_checksum {
            let actual = self
                .channel
                .remote_file_hash(&temp, self.algorithm, self.remote.hash_timeout())
                .map_err(|source| TransferError::RemoteHash {
                    temp: temp.clone(),
                    source,
                })?;
            if actual != content_hash {
                return Err(TransferError::ChecksumMismatch {
                    path: record.file_path.clone(),
                    expected: content_hash,
                    actual,
                });
            }
            debug!("Checksum verified for {}", temp);
        }

        // Step 6: commit, never over an existing archive object
        let committed = self
            .channel
            .rename_no_clobber(&temp, &dest, self.remote.command_timeout())
            .map_err(|source| TransferError::Commit {
                temp: temp.clone(),
                dest: dest.clone(),
                source,
            })?;
        if !committed {
            return Err(TransferError::DestinationTaken { temp, dest });
        }
        *temp_slot = None;

        Ok(TransferOutcome {
            local_path: record.file_path.clone(),
            remote_path: dest,
            content_hash,
            bytes,
        })
    }

    /// First name in `dir` that is free or already holds this content.
    /// An occupied name with other (or unverifiable) content is skipped, so
    /// same-named files from different folders never replace each other.
    fn choose_destination(
        &self,
        dir: &str,
        file_name: &str,
        content_hash: &str,
    ) -> Result<Destination, TransferError> {
        for n in 0..MAX_NAME_ATTEMPTS {
            let candidate = format!("{}/{}", dir, numbered_name(file_name, n));
            let taken = self
                .channel
                .remote_path_exists(&candidate, self.remote.command_timeout())
                .map_err(|source| TransferError::Destination {
                    dest: candidate.clone(),
                    source,
                })?;
            if !taken {
                return Ok(Destination::Free(candidate));
            }
            if self.verify_checksum && !content_hash.is_empty() {
                match self.channel.remote_file_hash(
                    &candidate,
                    self.algorithm,
                    self.remote.hash_timeout(),
                ) {
                    Ok(existing) if existing == content_hash => {
                        return Ok(Destination::Archived(candidate))
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Cannot hash existing {}: {}", candidate, e),
                }
            }
            debug!("{} holds a different file, trying the next name", candidate);
        }
        Err(TransferError::NamesExhausted {
            dir: dir.to_string(),
            name: file_name.to_string(),
            attempts: MAX_NAME_ATTEMPTS,
        })
    }

    /// Reuse the registered hash when it has the right shape for the
    /// configured algorithm, otherwise hash now and persist it.
    fn local_hash(&self, record: &FileRecord) -> Result<String, TransferError> {
        if !self.verify_checksum {
            return Ok(record.content_hash.clone());
        }
        if record.content_hash.len() == self.algorithm.hex_len() {
            return Ok(record.content_hash.clone());
        }
        let hash = file_checksum(Path::new(&record.file_path), self.algorithm).map_err(
            |source| TransferError::LocalRead {
                path: record.file_path.clone(),
                source,
            },
        )?;
        self.db.set_content_hash(&record.file_path, &hash)?;
        Ok(hash)
    }

    /// `<base>/YYYY/MM/DD` from a leading `YYYYMMDD` in the file name, or today.
    pub fn remote_dir_for(&self, file_name: &str) -> String {
        let today = Utc::now().date_naive();
        date_dir(
            self.remote.base_path.trim_end_matches('/'),
            file_name,
            today,
            self.remote.enable_date_structure,
        )
    }

    /// Remove `*.tmp.*` objects older than `max_age_minutes` left by
    /// transfers that died before their rename.
    pub fn cleanup_orphaned_temps(&self, max_age_minutes: u64) -> crate::error::Result<usize> {
        let command = format!(
            "find {} -type f -name '*.tmp.*' -mmin +{} -print -exec rm -f {{}} +",
            shell_quote(&self.remote.base_path),
            max_age_minutes
        );
        let output = self
            .channel
            .run_command(&command, self.remote.stream_timeout())?;
        if !output.success() {
            return Err(Error::Remote(format!(
                "orphaned temp sweep exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        let removed = output.stdout.lines().filter(|l| !l.is_empty()).count();
        if removed > 0 {
            info!("Removed {} orphaned temp objects", removed);
        }
        Ok(removed)
    }
}

fn date_dir(base: &str, file_name: &str, today: NaiveDate, by_name: bool) -> String {
    let date = if by_name {
        file_name
            .get(..8)
            .filter(|p| p.chars().all(|c| c.is_ascii_digit()))
            .and_then(|p| NaiveDate::parse_from_str(p, "%Y%m%d").ok())
            .unwrap_or(today)
    } else {
        today
    };
    format!("{}/{}", base, date.format("%Y/%m/%d"))
}

/// `name` itself for `n == 0`, else `stem_n.ext`.
fn numbered_name(file_name: &str, n: u32) -> String {
    if n == 0 {
        return file_name.to_string();
    }
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}_{}.{}", stem, n, ext),
        _ => format!("{}_{}", file_name, n),
    }
}

fn temp_name(dest: &str, millis: i64) -> String {
    format!("{}.tmp.{}", dest, millis)
}
