//! Projection of a finished analyzer onto electrode-level unit, metric and waveform
//! records.

use super::collab::{Analyzer, SortingEngine};
use super::orchestrator::ArtifactLayout;
use super::params::SorterId;
use crate::error::{Error, Outcome, PassSummary};
use crate::locator::DataLocator;
use crate::probe::{self, ContactMap};
use crate::progress::{PipelineReporter, SilentReporter};
use crate::storage::models::{
    ClusteringTask, UnitMetrics, UnitRecord, UnitWaveforms, CLUSTER_METRIC_COLUMNS,
    WAVEFORM_METRIC_COLUMNS,
};
use crate::storage::Database;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub const DEFAULT_QUALITY_LABEL: &str = "n.a.";

/// Engine metric names that differ from the stored column names.
pub const METRIC_RENAMES: [(&str, &str); 10] = [
    ("amplitude_median", "amplitude"),
    ("isi_violations_ratio", "isi_violation"),
    ("isi_violations_count", "number_violation"),
    ("silhouette", "silhouette_score"),
    ("rp_contamination", "contamination_rate"),
    ("drift_ptp", "max_drift"),
    ("drift_mad", "cumulative_drift"),
    ("half_width", "halfwidth"),
    ("peak_trough_ratio", "pt_ratio"),
    ("peak_to_valley", "duration"),
];

fn canonical_metric_name(name: &str) -> &str {
    METRIC_RENAMES
        .iter()
        .find(|(from, _)| *from == name)
        .map(|(_, to)| *to)
        .unwrap_or(name)
}

/// Analyzer channel positions -> electrodes, over the session probe's full configuration.
pub fn contact_map<A: Analyzer + ?Sized>(
    db: &Database,
    session_id: i64,
    analyzer: &A,
) -> Result<ContactMap, Error> {
    let (assignment, config) = probe::session_geometry(db, session_id)?;
    let full_map = probe::resolve(&config, assignment.port, None)?;
    full_map.bind_contacts(&analyzer.contact_ids()?)
}

/// One record per unit: peak electrode, label, spike train with per-spike sites and depths.
pub fn collect_units<A: Analyzer + ?Sized>(
    analyzer: &A,
    contacts: &ContactMap,
) -> Result<Vec<UnitRecord>, Error> {
    let best = analyzer.best_channels(1)?;
    let mut units = Vec::new();

    for unit_id in analyzer.unit_ids()? {
        let peak_channel = best
            .get(&unit_id)
            .and_then(|channels| channels.first())
            .copied()
            .ok_or_else(|| {
                Error::Consistency(format!("unit {} has no best channel", unit_id))
            })?;
        let peak_electrode = contacts.electrode(peak_channel)?;

        let spike_times = analyzer.spike_times(unit_id)?;
        let spike_sites = analyzer
            .spike_channels(unit_id)?
            .into_iter()
            .map(|channel| contacts.electrode(channel))
            .collect::<Result<Vec<_>, _>>()?;
        let spike_depths: Vec<f64> = analyzer
            .spike_locations(unit_id)?
            .into_iter()
            .map(|[_, y]| y)
            .collect();

        if spike_times.len() != spike_sites.len() || spike_times.len() != spike_depths.len() {
            return Err(Error::Consistency(format!(
                "unit {}: {} spike times, {} sites, {} depths",
                unit_id,
                spike_times.len(),
                spike_sites.len(),
                spike_depths.len()
            )));
        }

        units.push(UnitRecord {
            unit_id,
            peak_electrode,
            quality_label: analyzer
                .quality_label(unit_id)?
                .unwrap_or_else(|| DEFAULT_QUALITY_LABEL.to_string()),
            spike_count: analyzer.spike_count(unit_id)?,
            spike_times,
            spike_sites,
            spike_depths,
        });
    }
    Ok(units)
}

/// Rename engine metric columns, drop non-finite values, and project onto the stored
/// cluster and waveform columns.
pub fn collect_metrics(table: &BTreeMap<i64, BTreeMap<String, f64>>) -> Vec<UnitMetrics> {
    table
        .iter()
        .map(|(unit_id, row)| {
            let renamed: BTreeMap<&str, f64> = row
                .iter()
                .map(|(name, value)| (canonical_metric_name(name), *value))
                .collect();
            let values = CLUSTER_METRIC_COLUMNS
                .iter()
                .chain(WAVEFORM_METRIC_COLUMNS.iter())
                .map(|column| {
                    let value = renamed.get(column).copied().filter(|v| v.is_finite());
                    (*column, value)
                })
                .collect();
            UnitMetrics {
                unit_id: *unit_id,
                values,
            }
        })
        .collect()
}

/// Mean waveforms of one unit: the peak electrode's and every contact's.
pub fn unit_waveforms<A: Analyzer + ?Sized>(
    analyzer: &A,
    contacts: &ContactMap,
    unit: &UnitRecord,
) -> Result<UnitWaveforms, Error> {
    let template = analyzer.unit_template(unit.unit_id)?;
    if template.ncols() != contacts.len() {
        return Err(Error::Consistency(format!(
            "unit {} template has {} channels, recording has {} contacts",
            unit.unit_id,
            template.ncols(),
            contacts.len()
        )));
    }

    let electrode_waveforms: Vec<(u32, Vec<f32>)> = template
        .columns()
        .into_iter()
        .zip(contacts.electrodes())
        .map(|(column, electrode)| (*electrode, column.iter().map(|&v| v as f32).collect()))
        .collect();
    let peak_electrode_waveform = electrode_waveforms
        .iter()
        .find(|(electrode, _)| *electrode == unit.peak_electrode)
        .map(|(_, waveform)| waveform.clone())
        .ok_or_else(|| {
            Error::Consistency(format!(
                "peak electrode {} of unit {} is not among the recording contacts",
                unit.peak_electrode, unit.unit_id
            ))
        })?;

    Ok(UnitWaveforms {
        unit_id: unit.unit_id,
        peak_electrode: unit.peak_electrode,
        peak_electrode_waveform,
        electrode_waveforms,
    })
}

/// Populates unit, quality-metric and waveform records for clustered tasks.
pub struct Aggregator<'a, E: SortingEngine> {
    db: &'a Database,
    locator: &'a dyn DataLocator,
    engine: &'a E,
    reporter: &'a dyn PipelineReporter,
}

impl<'a, E: SortingEngine> Aggregator<'a, E> {
    pub fn new(db: &'a Database, locator: &'a dyn DataLocator, engine: &'a E) -> Self {
        Self {
            db,
            locator,
            engine,
            reporter: &SilentReporter,
        }
    }

    pub fn with_reporter(mut self, reporter: &'a dyn PipelineReporter) -> Self {
        self.reporter = reporter;
        self
    }

    fn load_analyzer(&self, task: &ClusteringTask) -> Result<E::Analyzer, Error> {
        let paramset = self.db.parameter_set(task.paramset_idx)?.ok_or_else(|| {
            Error::NotFound(format!("parameter set {}", task.paramset_idx))
        })?;
        let sorter: SorterId = paramset.clustering_method.parse()?;
        let stored = task.output_dir.as_deref().ok_or_else(|| {
            Error::Consistency(format!("task {} is clustered but has no output directory", task.id))
        })?;
        let output_dir = if Path::new(stored).is_absolute() {
            Path::new(stored).to_path_buf()
        } else {
            self.locator.processed_root().join(stored)
        };
        let layout = ArtifactLayout { output_dir, sorter };
        self.engine.load_analyzer(&layout.analyzer())
    }

    pub fn populate_units(&self, task: &ClusteringTask) -> Result<Outcome<usize>, Error> {
        let analyzer = self.load_analyzer(task)?;
        let contacts = contact_map(self.db, task.session_id, &analyzer)?;
        let units = collect_units(&analyzer, &contacts)?;
        let count = self.db.insert_units(task.id, &units)?;
        info!("Task {}: stored {} units", task.id, count);
        Ok(Outcome::Completed(count))
    }

    pub fn populate_metrics(&self, task: &ClusteringTask) -> Result<Outcome<usize>, Error> {
        let analyzer = self.load_analyzer(task)?;
        let metrics = collect_metrics(&analyzer.metrics()?);
        let count = self.db.insert_unit_metrics(task.id, &metrics)?;
        info!("Task {}: stored metrics for {} units", task.id, count);
        Ok(Outcome::Completed(count))
    }

    /// Streams one unit at a time into a single transaction.
    pub fn populate_waveforms(&self, task: &ClusteringTask) -> Result<Outcome<usize>, Error> {
        let analyzer = self.load_analyzer(task)?;
        let contacts = contact_map(self.db, task.session_id, &analyzer)?;
        let units = self.db.units(task.id)?;

        let mut writer = self.db.begin_waveforms(task.id)?;
        for unit in &units {
            writer.write(&unit_waveforms(&analyzer, &contacts, unit)?)?;
        }
        let count = writer.finish()?;
        debug!("Task {}: stored waveforms for {} units", task.id, count);
        Ok(Outcome::Completed(count))
    }

    fn run_pass<F>(&self, pass: &str, pending: Vec<ClusteringTask>, populate: F) -> PassSummary
    where
        F: Fn(&ClusteringTask) -> Result<Outcome<usize>, Error>,
    {
        let started = Instant::now();
        self.reporter.on_pass_start(pass, pending.len());
        let mut summary = PassSummary::default();
        for task in &pending {
            self.reporter.on_item_start(pass, task.id);
            let result = populate(task);
            match &result {
                Ok(Outcome::NotReady(reason)) => warn!("Task {} skipped {}: {}", task.id, pass, reason),
                Err(e) => error!("{} failed for task {}: {}", pass, task.id, e),
                Ok(Outcome::Completed(_)) => {}
            }
            summary.record(task.id, &result);
            self.reporter.on_item_complete(pass, task.id);
        }
        self.reporter
            .on_pass_complete(pass, &summary, started.elapsed().as_secs_f64());
        summary
    }

    /// Units first; metrics and waveforms depend on the stored units.
    pub fn populate_all(&self) -> Result<PassSummary, Error> {
        let mut summary = self.run_pass("units", self.db.tasks_pending_units()?, |task| {
            self.populate_units(task)
        });
        summary.merge(self.run_pass(
            "quality_metrics",
            self.db.tasks_pending_metrics()?,
            |task| self.populate_metrics(task),
        ));
        summary.merge(self.run_pass(
            "waveforms",
            self.db.tasks_pending_waveforms()?,
            |task| self.populate_waveforms(task),
        ));
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_metrics_renames_and_drops_infinities() {
        let mut row = BTreeMap::new();
        row.insert("firing_rate".to_string(), 4.5);
        row.insert("isi_violations_ratio".to_string(), 0.01);
        row.insert("drift_ptp".to_string(), f64::INFINITY);
        row.insert("peak_to_valley".to_string(), 0.0004);
        row.insert("num_spikes".to_string(), 120.0);
        let table = BTreeMap::from([(3_i64, row)]);

        let metrics = collect_metrics(&table);
        assert_eq!(metrics.len(), 1);
        let unit = &metrics[0];
        assert_eq!(unit.unit_id, 3);
        assert_eq!(unit.get("firing_rate"), Some(4.5));
        assert_eq!(unit.get("isi_violation"), Some(0.01));
        assert_eq!(unit.get("max_drift"), None);
        assert_eq!(unit.get("duration"), Some(0.0004));
        assert_eq!(unit.get("num_spikes"), None);
        assert_eq!(
            unit.values.len(),
            CLUSTER_METRIC_COLUMNS.len() + WAVEFORM_METRIC_COLUMNS.len()
        );
    }

    #[test]
    fn test_canonical_metric_name_passes_unknown_through() {
        assert_eq!(canonical_metric_name("silhouette"), "silhouette_score");
        assert_eq!(canonical_metric_name("snr"), "snr");
    }
}
