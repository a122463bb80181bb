use crate::hasher::HashAlgorithm;
use crate::reclaimer::CleanupRule;
use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level settings. Every section is optional in the config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub remote: RemoteConfig,
    pub local: LocalConfig,
    pub sync: SyncSettings,
    pub lock: LockConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Remote host reached through the system `ssh` binary.
    #[default]
    Ssh,
    /// Archive mounted on this host; commands run through `sh -c`.
    Local,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub channel: ChannelKind,
    /// Host alias from `~/.ssh/config`, or `user@host`.
    pub ssh_target: String,
    pub ssh_port: Option<u16>,
    pub base_path: String,
    pub enable_date_structure: bool,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub stream_timeout_secs: u64,
    pub hash_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            channel: ChannelKind::Ssh,
            ssh_target: "nas-edge".to_string(),
            ssh_port: None,
            base_path: "/volume1/homes/edge_sync/drone_media".to_string(),
            enable_date_structure: true,
            connect_timeout_secs: 10,
            command_timeout_secs: 30,
            stream_timeout_secs: 300,
            hash_timeout_secs: 60,
        }
    }
}

impl RemoteConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    pub fn hash_timeout(&self) -> Duration {
        Duration::from_secs(self.hash_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub media_path: PathBuf,
    pub exclude_patterns: Vec<String>,
    /// Files modified more recently than this are assumed to still be written.
    pub min_file_age_secs: u64,
    pub pending_deletes_path: PathBuf,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            media_path: PathBuf::from("/data/temp/dji/media"),
            exclude_patterns: vec![
                ".*".to_string(),
                ".tmp_*".to_string(),
                "*.tmp".to_string(),
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
                "desktop.ini".to_string(),
            ],
            min_file_age_secs: 60,
            pending_deletes_path: PathBuf::from("pending_deletes.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub interval_minutes: u64,
    pub max_retry_attempts: u32,
    pub batch_size: usize,
    pub enable_checksum: bool,
    pub checksum_algorithm: HashAlgorithm,
    pub delete_after_sync: bool,
    pub safe_delete_delay_minutes: u64,
    pub delete_max_retries: u32,
    /// Remote `*.tmp.*` objects older than this are swept as orphans.
    pub temp_sweep_age_minutes: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_minutes: 10,
            max_retry_attempts: 3,
            batch_size: 10,
            enable_checksum: true,
            checksum_algorithm: HashAlgorithm::Md5,
            delete_after_sync: true,
            safe_delete_delay_minutes: 30,
            delete_max_retries: 3,
            temp_sweep_age_minutes: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub lock_dir: PathBuf,
    pub name: String,
    /// Age after which a held lock is considered abandoned.
    pub timeout_secs: u64,
    /// How long a cycle waits for a busy lock. Zero means give up at once.
    pub wait_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_dir: PathBuf::from("run"),
            name: "media_sync".to_string(),
            timeout_secs: 3600,
            wait_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub warning_threshold_percent: f64,
    pub critical_threshold_percent: f64,
    pub cleanup_target_percent: f64,
    pub cleanup_rules: Vec<CleanupRule>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            warning_threshold_percent: 80.0,
            critical_threshold_percent: 90.0,
            cleanup_target_percent: 70.0,
            cleanup_rules: CleanupRule::defaults(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub retention_days: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("media_status.db"),
            retention_days: 30,
        }
    }
}

/// Load settings from `EdgeSync.toml` (or `path`), then `EDGE_SYNC__SECTION__KEY`
/// environment overrides.
pub fn load_configuration(path: Option<&Path>) -> Result<SyncConfig, ConfigError> {
    let file_source = match path {
        Some(p) => ConfigFile::from(p).required(true),
        None => ConfigFile::with_name("EdgeSync").required(false),
    };
    let builder = Config::builder()
        .add_source(file_source)
        .add_source(Environment::with_prefix("EDGE_SYNC").separator("__"))
        .build()?;
    builder.try_deserialize::<SyncConfig>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_deployment() {
        let config = SyncConfig::default();
        assert_eq!(config.remote.ssh_target, "nas-edge");
        assert_eq!(config.sync.safe_delete_delay_minutes, 30);
        assert_eq!(config.sync.delete_max_retries, 3);
        assert_eq!(config.lock.timeout_secs, 3600);
        assert!(config.sync.enable_checksum);
        assert_eq!(config.sync.checksum_algorithm, HashAlgorithm::Md5);
        assert_eq!(config.storage.cleanup_rules.len(), 4);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("EdgeSync.toml");
        fs::write(
            &path,
            r#"
[remote]
ssh_target = "archive@10.0.0.5"
channel = "local"

[sync]
checksum_algorithm = "sha256"
batch_size = 25
"#,
        )
        .unwrap();

        let config = load_configuration(Some(&path)).unwrap();
        assert_eq!(config.remote.ssh_target, "archive@10.0.0.5");
        assert_eq!(config.remote.channel, ChannelKind::Local);
        assert_eq!(config.sync.checksum_algorithm, HashAlgorithm::Sha256);
        assert_eq!(config.sync.batch_size, 25);
        // Untouched sections fall back to defaults
        assert_eq!(config.remote.command_timeout_secs, 30);
        assert_eq!(config.lock.name, "media_sync");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(load_configuration(Some(&path)).is_err());
    }
}
