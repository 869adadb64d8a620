use crate::error::PassSummary;

/// Trait for reporting pipeline progress.
///
/// The CLI implements it with indicatif spinners. All methods have default no-op
/// implementations.
pub trait PipelineReporter: Send + Sync {
    fn on_catalog_start(&self) {}
    fn on_catalog_progress(&self, _files_found: usize) {}
    fn on_catalog_complete(&self, _total_files: usize, _duration_secs: f64) {}
    fn on_pass_start(&self, _pass: &str, _pending: usize) {}
    fn on_item_start(&self, _pass: &str, _id: i64) {}
    fn on_item_complete(&self, _pass: &str, _id: i64) {}
    fn on_pass_complete(&self, _pass: &str, _summary: &PassSummary, _duration_secs: f64) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl PipelineReporter for SilentReporter {}
