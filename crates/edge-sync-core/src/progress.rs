/// Trait for reporting sync cycle progress.
///
/// The CLI implements it with indicatif; all methods default to no-ops.
pub trait SyncReporter: Send + Sync {
    fn on_cycle_start(&self) {}
    fn on_file_discovered(&self, _path: &str, _bytes: u64) {}
    fn on_transfer_start(&self, _total_files: usize) {}
    fn on_file_transferred(&self, _path: &str, _bytes: u64) {}
    fn on_file_failed(&self, _path: &str, _reason: &str) {}
    fn on_transfer_complete(&self, _transferred: usize, _failed: usize, _duration_secs: f64) {}
    fn on_deletes_processed(&self, _deleted: usize, _failed: usize) {}
    fn on_cycle_complete(&self, _duration_secs: f64) {}
}

/// No-op reporter for daemon and test use.
pub struct SilentReporter;

impl SyncReporter for SilentReporter {}
