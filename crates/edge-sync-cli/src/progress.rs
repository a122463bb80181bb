use colored::*;
use edge_sync_core::SyncReporter;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// Transfer progress bar for interactive `run`.
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn bar(&self) -> MutexGuard<'_, Option<ProgressBar>> {
        self.bar.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_bar(&self, pb: ProgressBar) {
        let mut guard = self.bar();
        if let Some(old) = guard.take() {
            old.finish_and_clear();
        }
        *guard = Some(pb);
    }

    fn finish_bar(&self) {
        if let Some(pb) = self.bar().take() {
            pb.finish_and_clear();
        }
    }
}

impl SyncReporter for CliReporter {
    fn on_cycle_start(&self) {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            pb.set_style(style.tick_chars(TICK_CHARS));
        }
        pb.set_message("Discovering media files...");
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_file_discovered(&self, path: &str, _bytes: u64) {
        if let Some(pb) = self.bar().as_ref() {
            pb.set_message(format!("Registered {}", path));
        }
    }

    fn on_transfer_start(&self, total_files: usize) {
        let pb = ProgressBar::new(total_files as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "  {spinner:.cyan} Transferring [{bar:30.cyan/dim}] {pos}/{len} files {msg}",
        ) {
            pb.set_style(style.progress_chars("━╸─").tick_chars(TICK_CHARS));
        }
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_file_transferred(&self, _path: &str, _bytes: u64) {
        if let Some(pb) = self.bar().as_ref() {
            pb.inc(1);
        }
    }

    fn on_file_failed(&self, path: &str, reason: &str) {
        if let Some(pb) = self.bar().as_ref() {
            pb.inc(1);
            pb.println(format!("  {} {}: {}", "✗".red(), path, reason));
        }
    }

    fn on_transfer_complete(&self, transferred: usize, failed: usize, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  {} Transfer complete: {} transferred, {} failed in {:.2}s",
            "✓".green(),
            transferred,
            failed,
            duration_secs
        );
    }

    fn on_deletes_processed(&self, deleted: usize, failed: usize) {
        if deleted > 0 || failed > 0 {
            eprintln!(
                "  {} Verified deletes: {} removed, {} deferred",
                "✓".green(),
                deleted,
                failed
            );
        }
    }
}
