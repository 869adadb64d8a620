//! Staged pipeline: PreProcessing -> Sorting -> PostProcessing -> Export, one
//! clustering task at a time.

use super::collab::{RecordingChannel, RecordingRequest, SortingEngine};
use super::memo::{self, MemoStatus, MARKER_FILE};
use super::params::{self, PostprocessingRequest, SorterId};
use super::stage::{Stage, TaskState};
use crate::catalog;
use crate::config::JobConfig;
use crate::error::{Error, Outcome, PassSummary};
use crate::locator::{self, DataLocator};
use crate::probe;
use crate::progress::{PipelineReporter, SilentReporter};
use crate::reader::RawReader;
use crate::storage::models::{ClusteringTask, ExportKind, ParameterSet, Session, StageResult};
use crate::storage::Database;
use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

pub const RECORDING_DIR: &str = "si_recording";
pub const SORTING_DIR: &str = "si_sorting";
pub const ANALYZER_DIR: &str = "sorting_analyzer";

/// Where a task's artifacts live.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    pub output_dir: PathBuf,
    pub sorter: SorterId,
}

impl ArtifactLayout {
    pub fn recording(&self) -> PathBuf {
        self.output_dir.join(RECORDING_DIR)
    }

    pub fn sorter_dir(&self) -> PathBuf {
        self.output_dir.join(self.sorter.sorter_name())
    }

    pub fn sorting(&self) -> PathBuf {
        self.sorter_dir().join(SORTING_DIR)
    }

    pub fn analyzer(&self) -> PathBuf {
        self.sorter_dir().join(ANALYZER_DIR)
    }

    pub fn export(&self, kind: ExportKind) -> PathBuf {
        self.sorter_dir().join(kind.folder_name())
    }
}

struct TaskContext {
    session: Session,
    paramset: ParameterSet,
    layout: ArtifactLayout,
}

pub struct Orchestrator<'a, R: RawReader + ?Sized, E: SortingEngine> {
    db: &'a Database,
    locator: &'a dyn DataLocator,
    reader: &'a R,
    engine: &'a E,
    jobs: JobConfig,
    reporter: &'a dyn PipelineReporter,
}

impl<'a, R: RawReader + ?Sized, E: SortingEngine> Orchestrator<'a, R, E> {
    pub fn new(
        db: &'a Database,
        locator: &'a dyn DataLocator,
        reader: &'a R,
        engine: &'a E,
    ) -> Self {
        Self {
            db,
            locator,
            reader,
            engine,
            jobs: JobConfig::default(),
            reporter: &SilentReporter,
        }
    }

    pub fn with_jobs(mut self, jobs: JobConfig) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_reporter(mut self, reporter: &'a dyn PipelineReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn pending(&self, stage: Stage) -> Result<Vec<ClusteringTask>, Error> {
        pending_tasks(self.db, stage)
    }

    fn context(&self, task: &ClusteringTask) -> Result<TaskContext, Error> {
        let paramset = self.db.parameter_set(task.paramset_idx)?.ok_or_else(|| {
            Error::NotFound(format!("parameter set {}", task.paramset_idx))
        })?;
        params::validate_required_keys(&paramset.params)?;
        let sorter: SorterId = paramset.clustering_method.parse()?;
        let session = self
            .db
            .get_session(task.session_id)?
            .ok_or_else(|| Error::NotFound(format!("session {}", task.session_id)))?;
        let output_dir = self.output_dir(task, &session, &paramset)?;
        Ok(TaskContext {
            session,
            paramset,
            layout: ArtifactLayout { output_dir, sorter },
        })
    }

    /// The task's output directory, inferred and written back on first use.
    fn output_dir(
        &self,
        task: &ClusteringTask,
        session: &Session,
        paramset: &ParameterSet,
    ) -> Result<PathBuf, Error> {
        let processed_root = self.locator.processed_root();
        let dir = match task.output_dir.as_deref().filter(|d| !d.is_empty()) {
            Some(stored) => {
                let stored = Path::new(stored);
                if stored.is_absolute() {
                    stored.to_path_buf()
                } else {
                    processed_root.join(stored)
                }
            }
            None => {
                let inferred = locator::infer_output_dir(
                    self.locator,
                    session,
                    &paramset.clustering_method,
                    paramset.paramset_idx,
                )?;
                let stored = inferred
                    .strip_prefix(processed_root)
                    .unwrap_or(&inferred)
                    .to_string_lossy()
                    .into_owned();
                self.db.set_task_output_dir(task.id, &stored)?;
                info!("Task {} output directory: {}", task.id, inferred.display());
                inferred
            }
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Run one stage for one task and record its completion.
    pub fn run_stage(
        &self,
        stage: Stage,
        task: &ClusteringTask,
    ) -> Result<Outcome<StageResult>, Error> {
        let state = TaskState::from_completed(&self.db.completed_stages(task.id)?)?;
        state.advance(stage)?;

        let execution_time = Utc::now();
        let started = Instant::now();
        let ctx = self.context(task)?;

        let outcome = match stage {
            Stage::PreProcessing => self.preprocess(task, &ctx)?,
            Stage::Sorting => self.sort(task, &ctx)?,
            Stage::PostProcessing => self.postprocess(task, &ctx)?,
            Stage::Export => self.export(task, &ctx)?,
        };
        if let Outcome::NotReady(reason) = outcome {
            return Ok(Outcome::NotReady(reason));
        }

        let result = StageResult {
            task_id: task.id,
            stage,
            execution_time,
            execution_duration: started.elapsed().as_secs_f64() / 3600.0,
        };
        let recorded = match stage {
            Stage::PostProcessing => self.db.insert_postprocessing_result(&result, Utc::now())?,
            _ => self.db.insert_stage_result(&result)?,
        };
        if !recorded {
            return Err(Error::Consistency(format!(
                "{} result for task {} was not recorded; upstream missing or already complete",
                stage.as_str(),
                task.id
            )));
        }
        info!(
            "Task {} completed {} in {:.2}s",
            task.id,
            stage.as_str(),
            started.elapsed().as_secs_f64()
        );
        Ok(Outcome::Completed(result))
    }

    fn preprocess(&self, task: &ClusteringTask, ctx: &TaskContext) -> Result<Outcome<()>, Error> {
        let method = params::preprocessing_method(&ctx.paramset.params)?;

        let files = catalog::session_files(self.db, self.locator, &ctx.session)?;
        let Some((first, first_path)) = files.first() else {
            return Ok(Outcome::NotReady(format!(
                "no raw data files for session {}",
                ctx.session.id
            )));
        };
        let acq_software = first.acq_software;
        if let Some((other, _)) = files.iter().find(|(f, _)| f.acq_software != acq_software) {
            return Err(Error::Consistency(format!(
                "session {} mixes {} and {} files",
                ctx.session.id, acq_software, other.acq_software
            )));
        }

        let (assignment, electrode_config) = probe::session_geometry(self.db, ctx.session.id)?;
        let header = self.reader.read_header(first_path)?;
        let full_map = probe::resolve(&electrode_config, assignment.port, None)?;
        let mut bindings = full_map.bind_rows(&header.amplifier_channels)?;

        if let Some(used) = assignment.used_electrodes.as_deref().filter(|u| !u.is_empty()) {
            let used_map = probe::resolve(&electrode_config, assignment.port, Some(used))?;
            let keep: HashSet<u32> = used_map.electrodes().into_iter().collect();
            let before = bindings.len();
            bindings.retain(|binding| keep.contains(&binding.electrode));
            debug!(
                "Task {}: removed {} unused electrodes",
                task.id,
                before - bindings.len()
            );
        }

        let channels = bindings
            .iter()
            .map(|binding| {
                let electrode = electrode_config.electrode(binding.electrode).ok_or_else(|| {
                    Error::Consistency(format!("electrode {} lost its geometry", binding.electrode))
                })?;
                Ok(RecordingChannel {
                    row: binding.row,
                    channel_id: binding.channel_id.clone(),
                    channel_idx: electrode.channel_idx,
                    electrode: electrode.electrode,
                    shank: electrode.shank,
                    x_coord: electrode.x_coord,
                    y_coord: electrode.y_coord,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let request = RecordingRequest::new(
            acq_software,
            assignment.port,
            files.iter().map(|(_, path)| path.clone()).collect(),
            channels,
            method,
        );
        let key = json!({
            "stage": Stage::PreProcessing.as_str(),
            "recording": serde_json::to_value(&request)?,
        });
        let status = memo::lookup_or_compute(&ctx.layout.recording(), &key, |dest| {
            self.engine.build_recording(&request, dest, &self.jobs)
        })?;
        log_status(task, Stage::PreProcessing, status);
        Ok(Outcome::Completed(()))
    }

    fn sort(&self, task: &ClusteringTask, ctx: &TaskContext) -> Result<Outcome<()>, Error> {
        let sorter_params = params::sorting_params(&ctx.paramset.params)?;
        let recording = require_artifact(ctx.layout.recording())?;

        let key = json!({
            "stage": Stage::Sorting.as_str(),
            "clustering_method": ctx.paramset.clustering_method,
            "params": sorter_params,
        });
        let status = memo::lookup_or_compute(&ctx.layout.sorting(), &key, |dest| {
            info!(
                "Task {}: running {} on {}",
                task.id,
                ctx.layout.sorter.sorter_name(),
                recording.display()
            );
            self.engine
                .run_sorter(&recording, ctx.layout.sorter, sorter_params, dest, &self.jobs)
        })?;
        log_status(task, Stage::Sorting, status);
        Ok(Outcome::Completed(()))
    }

    fn postprocess(&self, task: &ClusteringTask, ctx: &TaskContext) -> Result<Outcome<()>, Error> {
        let request = PostprocessingRequest::from_params(&ctx.paramset.params)?;
        let recording = require_artifact(ctx.layout.recording())?;
        let sorting = require_artifact(ctx.layout.sorting())?;
        let analyzer_dir = ctx.layout.analyzer();

        let key = json!({
            "stage": Stage::PostProcessing.as_str(),
            "params": params::postprocessing_params(&ctx.paramset.params)?,
            "analyzer": analyzer_dir.to_string_lossy(),
        });
        let status = memo::lookup_or_compute(&analyzer_dir, &key, |dest| {
            let analyzer = self.engine.create_analyzer(&recording, &sorting, dest, &self.jobs)?;
            let computable = self.engine.list_computable_extensions(&analyzer)?;
            for (name, _) in &request.extensions {
                if !computable.contains(name) {
                    warn!("Task {}: extension '{}' is not computable; skipping", task.id, name);
                }
            }
            for name in &computable {
                if let Some((_, ext_params)) = request.extensions.iter().find(|(n, _)| n == name) {
                    debug!("Task {}: computing extension {}", task.id, name);
                    self.engine
                        .compute_extension(&analyzer, name, ext_params, &self.jobs)?;
                }
            }
            Ok(())
        })?;
        log_status(task, Stage::PostProcessing, status);
        Ok(Outcome::Completed(()))
    }

    fn export(&self, task: &ClusteringTask, ctx: &TaskContext) -> Result<Outcome<()>, Error> {
        let request = PostprocessingRequest::from_params(&ctx.paramset.params)?;
        if request.exports.is_empty() {
            return Ok(Outcome::NotReady(format!(
                "parameter set {} requests no export",
                ctx.paramset.paramset_idx
            )));
        }
        let analyzer_dir = require_artifact(ctx.layout.analyzer())?;

        let mut analyzer = None;
        for kind in &request.exports {
            let dir = ctx.layout.export(*kind);
            let key = json!({
                "stage": Stage::Export.as_str(),
                "export": kind.as_str(),
                "analyzer": analyzer_dir.to_string_lossy(),
            });
            if !memo::is_complete(&dir, &key)? && analyzer.is_none() {
                analyzer = Some(self.engine.load_analyzer(&analyzer_dir)?);
            }
            let status = memo::lookup_or_compute(&dir, &key, |dest| match &analyzer {
                Some(analyzer) => self.engine.export(analyzer, *kind, dest, &self.jobs),
                None => Err(Error::Consistency(format!(
                    "analyzer for task {} was not loaded",
                    task.id
                ))),
            })?;
            log_status(task, Stage::Export, status);

            let manifest = export_manifest(&dir, &ctx.layout.output_dir)?;
            let inserted = self.db.insert_export_files(task.id, *kind, &manifest)?;
            debug!(
                "Task {}: {} export has {} files ({} new)",
                task.id,
                kind.as_str(),
                manifest.len(),
                inserted
            );
        }
        Ok(Outcome::Completed(()))
    }

    /// Run `stage` for every pending task.
    pub fn run_pending(&self, stage: Stage) -> Result<PassSummary, Error> {
        let pending = self.pending(stage)?;
        let started = Instant::now();
        self.reporter.on_pass_start(stage.as_str(), pending.len());

        let mut summary = PassSummary::default();
        for task in &pending {
            self.reporter.on_item_start(stage.as_str(), task.id);
            let result = self.run_stage(stage, task);
            match &result {
                Ok(Outcome::NotReady(reason)) => {
                    warn!("Task {} skipped {}: {}", task.id, stage.as_str(), reason)
                }
                Err(e) => error!("{} failed for task {}: {}", stage.as_str(), task.id, e),
                Ok(Outcome::Completed(_)) => {}
            }
            summary.record(task.id, &result);
            self.reporter.on_item_complete(stage.as_str(), task.id);
        }

        self.reporter
            .on_pass_complete(stage.as_str(), &summary, started.elapsed().as_secs_f64());
        Ok(summary)
    }

    /// Every stage in order; a task that fails a stage stays behind until the next run.
    pub fn run_all(&self) -> Result<PassSummary, Error> {
        let mut summary = PassSummary::default();
        for stage in Stage::ALL {
            summary.merge(self.run_pending(stage)?);
        }
        Ok(summary)
    }
}

/// Tasks eligible for `stage`: upstream complete, nothing recorded at or past `stage`,
/// and a parameter set that names a known sorter (and, for Export, asks for at least one
/// export).
pub fn pending_tasks(db: &Database, stage: Stage) -> Result<Vec<ClusteringTask>, Error> {
    let mut eligible = Vec::new();
    for task in db.candidate_tasks(stage)? {
        let Some(paramset) = db.parameter_set(task.paramset_idx)? else {
            warn!("Task {} references missing parameter set {}", task.id, task.paramset_idx);
            continue;
        };
        if paramset.clustering_method.parse::<SorterId>().is_err() {
            debug!(
                "Task {} skipped for {}: unsupported sorter '{}'",
                task.id,
                stage.as_str(),
                paramset.clustering_method
            );
            continue;
        }
        if stage == Stage::Export {
            let wants_export = PostprocessingRequest::from_params(&paramset.params)
                .map(|request| !request.exports.is_empty())
                .unwrap_or(false);
            if !wants_export {
                continue;
            }
        }
        eligible.push(task);
    }
    Ok(eligible)
}

fn require_artifact(dir: PathBuf) -> Result<PathBuf, Error> {
    if memo::is_published(&dir) {
        Ok(dir)
    } else {
        Err(Error::NotFound(format!(
            "published artifact {}",
            dir.display()
        )))
    }
}

fn log_status(task: &ClusteringTask, stage: Stage, status: MemoStatus) {
    match status {
        MemoStatus::Reused => info!("Task {}: reusing {} artifact", task.id, stage.as_str()),
        MemoStatus::Computed => debug!("Task {}: computed {} artifact", task.id, stage.as_str()),
    }
}

/// Files under `dir`, relative to `base`, sorted, excluding the completion marker.
pub fn export_manifest(dir: &Path, base: &Path) -> Result<Vec<String>, Error> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| {
            Error::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "walkdir loop detected")
            }))
        })?;
        if !entry.file_type().is_file() || entry.file_name() == MARKER_FILE {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(base)
            .map_err(|e| Error::Consistency(e.to_string()))?;
        files.push(relative.to_string_lossy().into_owned());
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_layout() {
        let layout = ArtifactLayout {
            output_dir: PathBuf::from("/p/O09/w/kilosort2-5_1"),
            sorter: SorterId::Kilosort2_5,
        };
        assert_eq!(layout.recording(), PathBuf::from("/p/O09/w/kilosort2-5_1/si_recording"));
        assert_eq!(
            layout.sorting(),
            PathBuf::from("/p/O09/w/kilosort2-5_1/kilosort2_5/si_sorting")
        );
        assert_eq!(
            layout.export(ExportKind::Report),
            PathBuf::from("/p/O09/w/kilosort2-5_1/kilosort2_5/spikeinterface_report")
        );
    }

    #[test]
    fn test_export_manifest_skips_marker() {
        let root = tempfile::tempdir().unwrap();
        let phy = root.path().join("kilosort4").join("phy");
        fs::create_dir_all(phy.join("sub")).unwrap();
        fs::write(phy.join("params.py"), b"x").unwrap();
        fs::write(phy.join("sub").join("spike_times.npy"), b"x").unwrap();
        fs::write(phy.join(MARKER_FILE), b"{}").unwrap();

        let manifest = export_manifest(&phy, root.path()).unwrap();
        assert_eq!(
            manifest,
            vec![
                "kilosort4/phy/params.py".to_string(),
                "kilosort4/phy/sub/spike_times.npy".to_string()
            ]
        );
    }

    #[test]
    fn test_require_artifact_needs_marker() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join(RECORDING_DIR);
        fs::create_dir_all(&dir).unwrap();
        assert_eq!(require_artifact(dir.clone()).unwrap_err().kind(), "not_found");
        memo::lookup_or_compute(&dir, &json!({}), |_| Ok(())).unwrap();
        assert!(require_artifact(dir).is_ok());
    }
}
