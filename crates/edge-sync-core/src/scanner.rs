use crate::error::Result;
use crate::hasher::{file_checksum, HashAlgorithm};
use crate::progress::SyncReporter;
use crate::storage::models::FileStatus;
use crate::storage::Database;
use glob::Pattern;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Which files under the media directory are candidates for sync.
pub struct ScanFilter {
    exclude: Vec<Pattern>,
    min_age: Duration,
}

impl ScanFilter {
    pub fn new(exclude_globs: &[String], min_age: Duration) -> Self {
        let exclude = exclude_globs
            .iter()
            .filter_map(|glob| match Pattern::new(glob) {
                Ok(p) => Some(p),
                Err(e) => {
                    error!("Invalid glob pattern '{}': {}", glob, e);
                    None
                }
            })
            .collect();
        Self { exclude, min_age }
    }

    /// Matched against the entry's own name, so `.*` hides dot-directories too.
    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclude.iter().any(|p| p.matches(name))
    }

    /// Files modified within `min_age` may still be written by the producer.
    pub fn is_settled(&self, modified: SystemTime, now: SystemTime) -> bool {
        now.duration_since(modified)
            .map(|age| age >= self.min_age)
            .unwrap_or(false)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub seen: usize,
    pub registered: usize,
    pub already_known: usize,
    pub too_recent: usize,
    pub failed: usize,
}

/// Register new files under `root` as `download=completed, transfer=pending`.
/// `algorithm` is `None` when checksums are disabled.
pub fn discover(
    root: &Path,
    filter: &ScanFilter,
    db: &Database,
    algorithm: Option<HashAlgorithm>,
    reporter: &dyn SyncReporter,
) -> Result<DiscoveryReport> {
    let mut report = DiscoveryReport::default();
    if !root.is_dir() {
        warn!("Media directory {} does not exist", root.display());
        return Ok(report);
    }
    let now = SystemTime::now();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !excluded(e, filter));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                error!("Error walking {}: {}", root.display(), e);
                report.failed += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        report.seen += 1;

        let path = entry.path();
        let path_str = path.to_string_lossy();
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                error!("Cannot stat {}: {}", path.display(), e);
                report.failed += 1;
                continue;
            }
        };
        if !metadata.modified().map(|m| filter.is_settled(m, now)).unwrap_or(false) {
            debug!("Skipping {}: modified too recently", path.display());
            report.too_recent += 1;
            continue;
        }
        if db.file_exists(&path_str)? {
            report.already_known += 1;
            continue;
        }

        let hash = match algorithm {
            Some(alg) => match file_checksum(path, alg) {
                Ok(h) => h,
                Err(e) => {
                    error!("Cannot hash {}: {}", path.display(), e);
                    report.failed += 1;
                    continue;
                }
            },
            None => String::new(),
        };
        let name = entry.file_name().to_string_lossy();
        if db.insert_file_record(
            &path_str,
            &name,
            i64::try_from(metadata.len()).unwrap_or(i64::MAX),
            &hash,
            FileStatus::Completed,
            FileStatus::Pending,
        )? {
            report.registered += 1;
            reporter.on_file_discovered(&path_str, metadata.len());
        } else {
            report.already_known += 1;
        }
    }

    info!(
        "Discovery under {}: {} files seen, {} new, {} known, {} too recent",
        root.display(),
        report.seen,
        report.registered,
        report.already_known,
        report.too_recent
    );
    Ok(report)
}

fn excluded(entry: &DirEntry, filter: &ScanFilter) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| filter.is_excluded(name))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclude_patterns_match_names() {
        let filter = ScanFilter::new(
            &[".*".into(), "*.tmp".into(), "Thumbs.db".into(), "[".into()],
            Duration::ZERO,
        );
        assert!(filter.is_excluded(".DS_Store"));
        assert!(filter.is_excluded("clip.mp4.tmp"));
        assert!(filter.is_excluded("Thumbs.db"));
        assert!(!filter.is_excluded("20230815_100000.mp4"));
    }

    #[test]
    fn test_settled_age() {
        let filter = ScanFilter::new(&[], Duration::from_secs(60));
        let now = SystemTime::now();
        assert!(filter.is_settled(now - Duration::from_secs(120), now));
        assert!(!filter.is_settled(now - Duration::from_secs(5), now));
        // Clock skew: modified in the future
        assert!(!filter.is_settled(now + Duration::from_secs(5), now));
    }
}
