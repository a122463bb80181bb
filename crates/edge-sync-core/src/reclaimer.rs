use crate::config::{RemoteConfig, StorageConfig};
use crate::error::{Error, Result};
use crate::remote::{shell_quote, RemoteChannel};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Files removed per `rm` invocation.
const DELETE_CHUNK: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    Normal,
    Warning,
    Critical,
}

impl fmt::Display for UsageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    pub status: UsageStatus,
    pub usage_percent: f64,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub files_deleted: usize,
    pub files_failed: usize,
}

/// Remote space management as seen by the sync engine: read usage, and ask
/// for reclamation.
pub trait StorageReclaimer: Send + Sync {
    fn check_usage(&self) -> Result<UsageReport>;
    fn cleanup(&self, force: bool) -> Result<CleanupReport>;
}

/// Age-based deletion rule, relative to the archive base path.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CleanupRule {
    /// `find -path` pattern, e.g. `*/logs/*`.
    pub path_pattern: String,
    /// `.log`, or `*` for any extension.
    pub file_extension: String,
    pub max_age_days: u32,
    /// Lower runs first.
    pub priority: u32,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl CleanupRule {
    pub fn new(path_pattern: &str, file_extension: &str, max_age_days: u32, priority: u32) -> Self {
        Self {
            path_pattern: path_pattern.to_string(),
            file_extension: file_extension.to_string(),
            max_age_days,
            priority,
            enabled: true,
        }
    }

    pub fn defaults() -> Vec<CleanupRule> {
        vec![
            CleanupRule::new("*/logs/*", ".log", 7, 1),
            CleanupRule::new("*/temp/*", "*", 1, 2),
            CleanupRule::new("*/media/*", ".jpg", 30, 3),
            CleanupRule::new("*/media/*", ".mp4", 60, 4),
        ]
    }

    fn find_command(&self, base: &str) -> String {
        let mut cmd = format!(
            "find {} -type f -path {}",
            shell_quote(base),
            shell_quote(&self.path_pattern)
        );
        if self.file_extension != "*" {
            cmd.push_str(&format!(" -name {}", shell_quote(&format!("*{}", self.file_extension))));
        }
        cmd.push_str(&format!(" -mmin +{}", u64::from(self.max_age_days) * 24 * 60));
        cmd
    }
}

pub struct RemoteStorageReclaimer {
    channel: Arc<dyn RemoteChannel>,
    remote: RemoteConfig,
    storage: StorageConfig,
}

impl RemoteStorageReclaimer {
    pub fn new(channel: Arc<dyn RemoteChannel>, remote: RemoteConfig, storage: StorageConfig) -> Self {
        Self {
            channel,
            remote,
            storage,
        }
    }

    fn classify(&self, usage_percent: f64) -> UsageStatus {
        if usage_percent >= self.storage.critical_threshold_percent {
            UsageStatus::Critical
        } else if usage_percent >= self.storage.warning_threshold_percent {
            UsageStatus::Warning
        } else {
            UsageStatus::Normal
        }
    }

    fn apply_rule(&self, rule: &CleanupRule, report: &mut CleanupReport) -> Result<()> {
        let command = rule.find_command(&self.remote.base_path);
        let output = self
            .channel
            .run_command(&command, self.remote.stream_timeout())?;
        if !output.success() {
            return Err(Error::Remote(format!(
                "find exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        let files: Vec<&str> = output.stdout.lines().filter(|l| !l.is_empty()).collect();
        debug!("Rule {} matched {} files", rule.path_pattern, files.len());

        for chunk in files.chunks(DELETE_CHUNK) {
            let args: Vec<String> = chunk.iter().map(|f| shell_quote(f)).collect();
            let command = format!("rm -f -- {}", args.join(" "));
            match self.channel.run_command(&command, self.remote.command_timeout()) {
                Ok(out) if out.success() => report.files_deleted += chunk.len(),
                Ok(out) => {
                    warn!("rm exited with {}: {}", out.exit_code, out.stderr.trim());
                    report.files_failed += chunk.len();
                }
                Err(e) => {
                    warn!("rm failed: {}", e);
                    report.files_failed += chunk.len();
                }
            }
        }
        Ok(())
    }
}

impl StorageReclaimer for RemoteStorageReclaimer {
    fn check_usage(&self) -> Result<UsageReport> {
        let command = format!("df -P -B1 {}", shell_quote(&self.remote.base_path));
        let output = self
            .channel
            .run_command(&command, self.remote.command_timeout())?;
        if !output.success() {
            return Err(Error::Remote(format!(
                "df exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        let (total_bytes, used_bytes, available_bytes) = parse_df(&output.stdout)
            .ok_or_else(|| Error::Remote(format!("unparseable df output: {:?}", output.stdout)))?;
        let usage_percent = if total_bytes == 0 {
            0.0
        } else {
            used_bytes as f64 * 100.0 / total_bytes as f64
        };
        Ok(UsageReport {
            status: self.classify(usage_percent),
            usage_percent,
            total_bytes,
            used_bytes,
            available_bytes,
        })
    }

    /// Apply enabled rules by priority until usage drops to the cleanup
    /// target. Unforced calls do nothing below the warning threshold.
    fn cleanup(&self, force: bool) -> Result<CleanupReport> {
        let usage = self.check_usage()?;
        if !force && usage.status == UsageStatus::Normal {
            debug!("Storage at {:.1}%, no cleanup needed", usage.usage_percent);
            return Ok(CleanupReport::default());
        }
        info!(
            "Starting storage cleanup at {:.1}% ({})",
            usage.usage_percent, usage.status
        );

        let mut rules: Vec<&CleanupRule> = self.storage.cleanup_rules.iter().filter(|r| r.enabled).collect();
        rules.sort_by_key(|r| r.priority);

        let mut report = CleanupReport::default();
        for rule in rules {
            if let Err(e) = self.apply_rule(rule, &mut report) {
                warn!("Cleanup rule {} failed: {}", rule.path_pattern, e);
                continue;
            }
            let usage = self.check_usage()?;
            if usage.usage_percent <= self.storage.cleanup_target_percent {
                info!("Storage down to {:.1}%, stopping cleanup", usage.usage_percent);
                break;
            }
        }
        info!(
            "Storage cleanup finished: {} deleted, {} failed",
            report.files_deleted, report.files_failed
        );
        Ok(report)
    }
}

/// `(total, used, available)` from POSIX `df -P -B1` output.
fn parse_df(stdout: &str) -> Option<(u64, u64, u64)> {
    let line = stdout.lines().nth(1)?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    // The filesystem name may contain spaces; count from the right.
    if fields.len() < 6 {
        return None;
    }
    let n = fields.len();
    let total = fields[n - 5].parse().ok()?;
    let used = fields[n - 4].parse().ok()?;
    let available = fields[n - 3].parse().ok()?;
    Some((total, used, available))
}
