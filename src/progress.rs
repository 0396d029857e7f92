//! Progress reporting for scans and imports
//!
//! A spinner samples the shared scan counters on an interval and shows
//! entry/byte totals plus the directory a worker is currently in; the
//! hardlink commit phase reports its own done/total pair. Summaries are
//! printed after the work completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};

use crate::model::{HardlinkProgress, Tree};
use crate::sink::ScanCounters;

/// Spinner-based status display.
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Create a new reporter.
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .expect("Invalid progress template")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    /// Update from the scan counters.
    pub fn update_scan(&self, counters: &ScanCounters) {
        let (files, bytes) = counters.totals();
        let current = counters
            .workers
            .iter()
            .find_map(|w| w.current_dir.lock().clone());
        let msg = match current {
            Some(dir) => format!(
                "Items: {} | Size: {} | {}",
                group_digits(files),
                format_size(bytes, BINARY),
                dir.display()
            ),
            None => format!(
                "Items: {} | Size: {}",
                group_digits(files),
                format_size(bytes, BINARY)
            ),
        };
        self.bar.set_message(msg);
    }

    /// Update from the hardlink commit counters.
    pub fn update_hardlinks(&self, progress: &HardlinkProgress) {
        let done = progress.done.load(Ordering::Relaxed);
        let total = progress.total.load(Ordering::Relaxed);
        if total > 0 {
            self.bar
                .set_message(format!("Counting hardlinks... {done}/{total}"));
        }
    }

    /// Set a status message.
    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    /// Finish and clear the display.
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a sampling thread that updates the display until `stop` is set.
pub fn spawn_reporter(
    counters: Arc<ScanCounters>,
    hardlinks: Arc<HardlinkProgress>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("progress".to_string())
        .spawn(move || {
            let reporter = ProgressReporter::new();
            while !stop.load(Ordering::Relaxed) {
                if hardlinks.total.load(Ordering::Relaxed) > 0 {
                    reporter.update_hardlinks(&hardlinks);
                } else {
                    reporter.update_scan(&counters);
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            reporter.finish();
        })
        .expect("Failed to spawn progress thread")
}

/// Print the post-scan summary for a tree.
pub fn print_summary(tree: &Tree, duration: Duration) {
    let root = tree.dir(tree.root());
    let path = tree.path(tree.root());

    println!();
    if tree.complete {
        println!("{}", style("Scan Complete").green().bold());
    } else {
        println!("{}", style("Scan Interrupted").yellow().bold());
    }
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Path:").bold(), path.display());
    println!(
        "  {} {}",
        style("Items:").bold(),
        group_digits(u64::from(root.items))
    );
    println!(
        "  {} {}",
        style("Apparent size:").bold(),
        format_size(root.cum.size, BINARY)
    );
    println!(
        "  {} {}",
        style("Disk usage:").bold(),
        format_size(root.cum.blocks.saturating_mul(512), BINARY)
    );
    if root.shared.size > 0 {
        println!(
            "  {} {}",
            style("Shared (hardlinks):").bold(),
            format_size(root.shared.size, BINARY)
        );
    }
    if root.suberr || root.err {
        println!(
            "  {} some directories could not be read",
            style("Warning:").yellow().bold()
        );
    }
    println!("  {} {:.1}s", style("Duration:").bold(), duration.as_secs_f64());
    println!();
}

/// Print the header before a scan starts.
pub fn print_header(path: &std::path::Path, threads: usize) {
    println!();
    println!(
        "{} {}",
        style("duscan").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Path:").bold(), path.display());
    println!("  {} {}", style("Threads:").bold(), threads);
    println!();
}

/// Render an item count with thousands separators. Byte sizes go through
/// `humansize` instead; counts are shown exact.
fn group_digits(n: u64) -> String {
    let mut out = String::new();
    let mut rest = n;
    let mut groups = [0u16; 7];
    let mut used = 0;
    loop {
        groups[used] = (rest % 1000) as u16;
        used += 1;
        rest /= 1000;
        if rest == 0 {
            break;
        }
    }
    out.push_str(&groups[used - 1].to_string());
    for &g in groups[..used - 1].iter().rev() {
        out.push(',');
        out.push_str(&format!("{g:03}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_digits() {
        assert_eq!(group_digits(0), "0");
        assert_eq!(group_digits(7), "7");
        assert_eq!(group_digits(1_000), "1,000");
        assert_eq!(group_digits(42_001), "42,001");
        assert_eq!(group_digits(1_000_007), "1,000,007");
        assert_eq!(group_digits(u64::from(u32::MAX)), "4,294,967,295");
    }
}
