use super::models::*;
use super::sqlite::{now_timestamp, Database};
use crate::error::Result;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info, warn};

const SELECT_COLUMNS: &str = "SELECT id, file_path, file_name, file_size, file_hash, \
     download_status, download_start_time, download_end_time, \
     transfer_status, transfer_start_time, transfer_end_time, transfer_retry_count, \
     last_error_message, created_at, updated_at \
     FROM media_transfer_status";

fn parse_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<FileStatus> {
    let raw: String = row.get(idx)?;
    raw.parse::<FileStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        file_path: row.get(1)?,
        file_name: row.get(2)?,
        file_size: row.get(3)?,
        content_hash: row.get(4)?,
        download_status: parse_status(row, 5)?,
        download_start_time: row.get(6)?,
        download_end_time: row.get(7)?,
        transfer_status: parse_status(row, 8)?,
        transfer_start_time: row.get(9)?,
        transfer_end_time: row.get(10)?,
        transfer_retry_count: row.get(11)?,
        last_error_message: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

impl Database {
    // ── Registration ─────────────────────────────────────────────

    /// Register a discovered file. Returns `Ok(false)` without touching the
    /// existing row when the path is already present.
    pub fn insert_file_record(
        &self,
        file_path: &str,
        file_name: &str,
        file_size: i64,
        content_hash: &str,
        download_status: FileStatus,
        transfer_status: FileStatus,
    ) -> Result<bool> {
        let now = now_timestamp();
        let download_stamp = (download_status == FileStatus::Completed).then(|| now.clone());
        let conn = self.lock_conn();
        let inserted = self.logged(
            "insert",
            conn.execute(
                "INSERT INTO media_transfer_status \
                 (file_path, file_name, file_size, file_hash, \
                  download_status, download_start_time, download_end_time, \
                  transfer_status, transfer_retry_count, last_error_message, \
                  created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, 0, '', ?8, ?8) \
                 ON CONFLICT(file_path) DO NOTHING",
                params![
                    file_path,
                    file_name,
                    file_size,
                    content_hash,
                    download_status.as_str(),
                    download_stamp,
                    transfer_status.as_str(),
                    now,
                ],
            ),
        )?;

        if inserted == 0 {
            warn!("File record already exists, insert ignored: {}", file_path);
            return Ok(false);
        }
        info!(
            "Registered {} (download: {}, transfer: {})",
            file_path, download_status, transfer_status
        );
        Ok(true)
    }

    pub fn file_exists(&self, file_path: &str) -> Result<bool> {
        let conn = self.lock_conn();
        let count: i64 = self.logged(
            "exists",
            conn.query_row(
                "SELECT COUNT(*) FROM media_transfer_status WHERE file_path = ?1",
                params![file_path],
                |row| row.get(0),
            ),
        )?;
        Ok(count > 0)
    }

    pub fn get_file_record(&self, file_path: &str) -> Result<Option<FileRecord>> {
        let conn = self.lock_conn();
        let sql = format!("{} WHERE file_path = ?1", SELECT_COLUMNS);
        self.logged(
            "lookup",
            conn.query_row(&sql, params![file_path], row_to_record)
                .optional(),
        )
    }

    // ── Transfer state machine ───────────────────────────────────

    /// Files whose download finished and whose transfer has not started,
    /// oldest first.
    pub fn get_ready_to_transfer(&self) -> Result<Vec<FileRecord>> {
        let records = self.query_records(
            "ready_to_transfer",
            "WHERE download_status = 'completed' AND transfer_status = 'pending' \
             ORDER BY created_at ASC, id ASC",
            &[],
        )?;
        debug!("{} files ready to transfer", records.len());
        Ok(records)
    }

    /// Move a row along `pending|failed → downloading → completed|failed`.
    ///
    /// `downloading` stamps the start time, `completed` the end time, and
    /// `failed` bumps the retry counter. Returns `Ok(false)` when no row
    /// matches or the transition is not allowed.
    pub fn update_transfer_status(
        &self,
        file_path: &str,
        status: FileStatus,
        error_message: &str,
    ) -> Result<bool> {
        let predecessors = status.allowed_predecessors();
        if predecessors.is_empty() {
            warn!("Refusing transfer transition to '{}' for {}", status, file_path);
            return Ok(false);
        }

        let stamp_column = match status {
            FileStatus::Downloading => "transfer_start_time = ?1, transfer_end_time = NULL, ",
            FileStatus::Completed => "transfer_end_time = ?1, ",
            FileStatus::Failed => "transfer_retry_count = transfer_retry_count + 1, ",
            FileStatus::Pending => "",
        };
        let guard = if status == FileStatus::Completed && self.hash_required() {
            " AND file_hash <> ''"
        } else {
            ""
        };
        let allowed = predecessors
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE media_transfer_status SET transfer_status = ?2, {}\
             last_error_message = ?3, updated_at = ?1 \
             WHERE file_path = ?4 AND transfer_status IN ({}){}",
            stamp_column, allowed, guard
        );

        let now = now_timestamp();
        let conn = self.lock_conn();
        let changed = self.logged(
            "update_transfer_status",
            conn.execute(&sql, params![now, status.as_str(), error_message, file_path]),
        )?;
        if changed > 0 {
            info!("Transfer status updated: {} -> {}", file_path, status);
            return Ok(true);
        }

        let current: Option<(String, String)> = self.logged(
            "update_transfer_status",
            conn.query_row(
                "SELECT transfer_status, file_hash FROM media_transfer_status WHERE file_path = ?1",
                params![file_path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional(),
        )?;
        match current {
            None => warn!("No file record for {}", file_path),
            Some((from, hash)) if hash.is_empty() && !guard.is_empty() => warn!(
                "Refusing {} -> {} for {}: content hash is empty",
                from, status, file_path
            ),
            Some((from, _)) => warn!(
                "Illegal transfer transition {} -> {} for {}",
                from, status, file_path
            ),
        }
        Ok(false)
    }

    /// Persist a content hash computed after registration. Completed rows keep
    /// the hash they were verified with.
    pub fn set_content_hash(&self, file_path: &str, content_hash: &str) -> Result<bool> {
        let conn = self.lock_conn();
        let changed = self.logged(
            "set_content_hash",
            conn.execute(
                "UPDATE media_transfer_status SET file_hash = ?1, updated_at = ?2 \
                 WHERE file_path = ?3 AND transfer_status <> 'completed'",
                params![content_hash, now_timestamp(), file_path],
            ),
        )?;
        if changed == 0 {
            warn!("Content hash not stored for {}", file_path);
        }
        Ok(changed > 0)
    }

    /// Rows left in `downloading` by a sync process that died mid-transfer.
    /// Only safe to call while holding the sync lock.
    pub fn recover_interrupted(&self, reason: &str) -> Result<usize> {
        let conn = self.lock_conn();
        let recovered = self.logged(
            "recover_interrupted",
            conn.execute(
                "UPDATE media_transfer_status SET transfer_status = 'failed', \
                 transfer_retry_count = transfer_retry_count + 1, \
                 last_error_message = ?1, updated_at = ?2 \
                 WHERE transfer_status = 'downloading'",
                params![reason, now_timestamp()],
            ),
        )?;
        if recovered > 0 {
            warn!("Marked {} interrupted transfers as failed", recovered);
        }
        Ok(recovered)
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Failed transfers still under the retry budget, least recently touched first.
    pub fn get_failed_files(&self, max_retry_count: i64) -> Result<Vec<FileRecord>> {
        self.query_records(
            "failed_files",
            "WHERE transfer_status = 'failed' AND transfer_retry_count < ?1 \
             ORDER BY updated_at ASC, id ASC",
            &[&max_retry_count],
        )
    }

    pub fn get_files_by_status(&self, status: FileStatus) -> Result<Vec<FileRecord>> {
        self.query_records(
            "files_by_status",
            "WHERE transfer_status = ?1 ORDER BY created_at ASC, id ASC",
            &[&status.as_str()],
        )
    }

    pub fn get_all_files(&self) -> Result<Vec<FileRecord>> {
        self.query_records("all_files", "ORDER BY created_at ASC, id ASC", &[])
    }

    pub fn get_statistics(&self) -> Result<StoreStatistics> {
        let conn = self.lock_conn();
        self.logged(
            "statistics",
            conn.query_row(
                "SELECT COUNT(*), \
                 COALESCE(SUM(CASE WHEN download_status = 'completed' THEN 1 ELSE 0 END), 0), \
                 COALESCE(SUM(CASE WHEN transfer_status = 'completed' THEN 1 ELSE 0 END), 0), \
                 COALESCE(SUM(CASE WHEN download_status = 'failed' OR transfer_status = 'failed' \
                          THEN 1 ELSE 0 END), 0) \
                 FROM media_transfer_status",
                [],
                |row| {
                    Ok(StoreStatistics {
                        total_files: row.get(0)?,
                        downloaded_files: row.get(1)?,
                        transferred_files: row.get(2)?,
                        failed_files: row.get(3)?,
                    })
                },
            ),
        )
    }

    /// Retention sweep: physically delete rows created more than `days_old` days ago.
    pub fn cleanup_old_records(&self, days_old: u32) -> Result<usize> {
        let cutoff = (Utc::now() - ChronoDuration::days(i64::from(days_old)))
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        let conn = self.lock_conn();
        let deleted = self.logged(
            "cleanup_old_records",
            conn.execute(
                "DELETE FROM media_transfer_status WHERE created_at < ?1",
                params![cutoff],
            ),
        )?;
        info!("Removed {} records older than {} days", deleted, days_old);
        Ok(deleted)
    }

    fn query_records(
        &self,
        op: &str,
        clause: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<FileRecord>> {
        let conn = self.lock_conn();
        let sql = format!("{} {}", SELECT_COLUMNS, clause);
        let result = conn.prepare(&sql).and_then(|mut stmt| {
            let rows = stmt.query_map(args, row_to_record)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        });
        self.logged(op, result)
    }
}
