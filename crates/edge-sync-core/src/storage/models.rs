use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Four-state vocabulary shared by the download leg and the remote transfer leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Prior states from which a transfer may move into `self`.
    pub fn allowed_predecessors(&self) -> &'static [FileStatus] {
        match self {
            Self::Pending => &[],
            Self::Downloading => &[Self::Pending, Self::Failed],
            Self::Completed | Self::Failed => &[Self::Downloading],
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = String;

    /// Accepts the stored names plus the `transferred` / `transferring` aliases
    /// used by operator tooling.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "downloading" | "transferring" => Ok(Self::Downloading),
            "completed" | "transferred" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown file status '{}'", other)),
        }
    }
}

/// One discovered file, keyed by its absolute local path.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub id: i64,
    pub file_path: String,
    pub file_name: String,
    pub file_size: i64,
    pub content_hash: String,
    pub download_status: FileStatus,
    pub download_start_time: Option<String>,
    pub download_end_time: Option<String>,
    pub transfer_status: FileStatus,
    pub transfer_start_time: Option<String>,
    pub transfer_end_time: Option<String>,
    pub transfer_retry_count: i64,
    pub last_error_message: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Row counts across the whole table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStatistics {
    pub total_files: i64,
    pub downloaded_files: i64,
    pub transferred_files: i64,
    pub failed_files: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_aliases() {
        assert_eq!("transferred".parse::<FileStatus>().unwrap(), FileStatus::Completed);
        assert_eq!("TRANSFERRING".parse::<FileStatus>().unwrap(), FileStatus::Downloading);
        assert_eq!("Pending".parse::<FileStatus>().unwrap(), FileStatus::Pending);
        assert!("archived".parse::<FileStatus>().is_err());
    }

    #[test]
    fn test_transitions_only_advance() {
        assert!(FileStatus::Downloading
            .allowed_predecessors()
            .contains(&FileStatus::Pending));
        assert!(!FileStatus::Completed
            .allowed_predecessors()
            .contains(&FileStatus::Pending));
        assert!(FileStatus::Pending.allowed_predecessors().is_empty());
    }
}
