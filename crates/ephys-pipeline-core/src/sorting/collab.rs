//! Seams to the external sorting engine and to the analyzer artifacts it produces.
//!
//! Artifacts are opaque directories. The orchestrator only decides where they live and
//! whether they are complete; building and reading them is the engine's business.

use super::params::{PreprocessStep, PreprocessingMethod, SorterId};
use crate::config::JobConfig;
use crate::error::Error;
use crate::storage::models::{AcquisitionSoftware, ExportKind, Port};
use ndarray::Array2;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One raw row kept in the recording, with the geometry of its electrode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingChannel {
    pub row: usize,
    pub channel_id: String,
    /// Probe channel index; the recording reports it back as the contact id.
    pub channel_idx: u32,
    pub electrode: u32,
    pub shank: u32,
    pub x_coord: f64,
    pub y_coord: f64,
}

/// Everything the engine needs to build a preprocessed recording artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingRequest {
    pub acq_software: AcquisitionSoftware,
    pub port: Port,
    /// Raw files in acquisition-time order.
    pub files: Vec<PathBuf>,
    /// Kept channels, sorted by row.
    pub channels: Vec<RecordingChannel>,
    pub preprocessing_method: String,
    pub steps: Vec<PreprocessStep>,
}

impl RecordingRequest {
    pub fn new(
        acq_software: AcquisitionSoftware,
        port: Port,
        files: Vec<PathBuf>,
        channels: Vec<RecordingChannel>,
        method: PreprocessingMethod,
    ) -> Self {
        Self {
            acq_software,
            port,
            files,
            channels,
            preprocessing_method: method.as_str().to_string(),
            steps: method.steps(),
        }
    }
}

/// External spike-sorting engine.
///
/// Every method that writes does so into `dest`, a directory that already exists and is
/// owned by the call; publishing it is the caller's job.
pub trait SortingEngine: Send + Sync {
    type Analyzer: Analyzer;

    fn build_recording(
        &self,
        request: &RecordingRequest,
        dest: &Path,
        jobs: &JobConfig,
    ) -> Result<(), Error>;

    fn run_sorter(
        &self,
        recording: &Path,
        sorter: SorterId,
        params: &Value,
        dest: &Path,
        jobs: &JobConfig,
    ) -> Result<(), Error>;

    fn create_analyzer(
        &self,
        recording: &Path,
        sorting: &Path,
        dest: &Path,
        jobs: &JobConfig,
    ) -> Result<Self::Analyzer, Error>;

    /// Extensions the analyzer can compute, in the order they must be computed.
    fn list_computable_extensions(&self, analyzer: &Self::Analyzer) -> Result<Vec<String>, Error>;

    fn compute_extension(
        &self,
        analyzer: &Self::Analyzer,
        name: &str,
        params: &Value,
        jobs: &JobConfig,
    ) -> Result<(), Error>;

    fn export(
        &self,
        analyzer: &Self::Analyzer,
        kind: ExportKind,
        dest: &Path,
        jobs: &JobConfig,
    ) -> Result<(), Error>;

    fn load_analyzer(&self, dir: &Path) -> Result<Self::Analyzer, Error>;
}

/// Read access to a finished analyzer artifact.
///
/// Channel positions (`usize`) index into [`Analyzer::contact_ids`].
pub trait Analyzer {
    fn unit_ids(&self) -> Result<Vec<i64>, Error>;

    /// Probe channel index of every analyzer channel, in analyzer order.
    fn contact_ids(&self) -> Result<Vec<u32>, Error>;

    /// The `k` channels with the largest template amplitude per unit.
    fn best_channels(&self, k: usize) -> Result<BTreeMap<i64, Vec<usize>>, Error>;

    fn spike_count(&self, unit_id: i64) -> Result<usize, Error>;

    /// Seconds from recording start.
    fn spike_times(&self, unit_id: i64) -> Result<Vec<f64>, Error>;

    fn spike_channels(&self, unit_id: i64) -> Result<Vec<usize>, Error>;

    /// (x, y) per spike, in microns.
    fn spike_locations(&self, unit_id: i64) -> Result<Vec<[f64; 2]>, Error>;

    /// Sorter-assigned label (e.g. Kilosort's `KSLabel`), if the sorter sets one.
    fn quality_label(&self, unit_id: i64) -> Result<Option<String>, Error>;

    /// Quality and template metrics per unit, under the engine's own column names.
    fn metrics(&self) -> Result<BTreeMap<i64, BTreeMap<String, f64>>, Error>;

    /// Mean waveform, samples x channels.
    fn unit_template(&self, unit_id: i64) -> Result<Array2<f64>, Error>;
}
