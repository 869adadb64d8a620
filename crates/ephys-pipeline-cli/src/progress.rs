use ephys_pipeline_core::{PassSummary, PipelineReporter};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

const TICKS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// CLI progress reporter using indicatif.
///
/// - Catalog: spinner (file count unknown upfront)
/// - Passes: progress bar over the pending items
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(pb) = guard.as_ref() {
                f(pb);
            }
        }
    }

    fn set_bar(&self, pb: ProgressBar) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(old) = guard.replace(pb) {
                old.finish_and_clear();
            }
        }
    }

    fn finish_bar(&self) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(pb) = guard.take() {
                pb.finish_and_clear();
            }
        }
    }
}

impl PipelineReporter for CliReporter {
    fn on_catalog_start(&self) {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            pb.set_style(style.tick_chars(TICKS));
        }
        pb.set_message("Cataloging raw files...");
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_catalog_progress(&self, files_found: usize) {
        self.with_bar(|pb| pb.set_message(format!("Cataloging... {} files found", files_found)));
    }

    fn on_catalog_complete(&self, total_files: usize, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Catalog complete: {} files in {:.2}s",
            total_files, duration_secs
        );
    }

    fn on_pass_start(&self, pass: &str, pending: usize) {
        let pb = ProgressBar::new(pending as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "  {spinner:.cyan} {prefix} [{bar:30.cyan/dim}] {pos}/{len} ({msg})",
        ) {
            pb.set_style(style.progress_chars("━╸─").tick_chars(TICKS));
        }
        pb.set_prefix(pass.to_string());
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_item_start(&self, _pass: &str, id: i64) {
        self.with_bar(|pb| pb.set_message(format!("#{}", id)));
    }

    fn on_item_complete(&self, _pass: &str, _id: i64) {
        self.with_bar(|pb| pb.inc(1));
    }

    fn on_pass_complete(&self, pass: &str, summary: &PassSummary, duration_secs: f64) {
        self.finish_bar();
        if summary.total() == 0 {
            return;
        }
        let mark = if summary.failed.is_empty() {
            "\x1b[32m✓\x1b[0m"
        } else {
            "\x1b[31m✗\x1b[0m"
        };
        eprintln!(
            "  {} {}: {} completed, {} skipped, {} failed in {:.2}s",
            mark,
            pass,
            summary.completed.len(),
            summary.skipped.len(),
            summary.failed.len(),
            duration_secs
        );
    }
}
