//! JSON import of the user-declared entities: probes, electrode configurations,
//! sessions with their probe assignments, and clustering tasks.

use chrono::NaiveDateTime;
use ephys_pipeline_core::probe::{self, Electrode, ElectrodeConfig};
use ephys_pipeline_core::sorting::insert_parameter_set;
use ephys_pipeline_core::storage::models::{Port, Probe, ProbeAssignment, Session, SessionType};
use ephys_pipeline_core::storage::Database;
use ephys_pipeline_core::Error;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub probes: Vec<Probe>,
    #[serde(default)]
    pub electrode_configs: Vec<ElectrodeConfigEntry>,
    #[serde(default)]
    pub sessions: Vec<SessionEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ElectrodeConfigEntry {
    pub probe_type: String,
    pub electrodes: Vec<Electrode>,
}

#[derive(Debug, Deserialize)]
pub struct SessionEntry {
    pub experiment_ref: String,
    #[serde(default = "default_insertion")]
    pub insertion_number: i64,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub session_type: SessionType,
    #[serde(default)]
    pub probe: Option<AssignmentEntry>,
    /// Parameter sets to queue clustering tasks for.
    #[serde(default)]
    pub paramsets: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AssignmentEntry {
    pub probe_id: String,
    pub port: Port,
    #[serde(default)]
    pub used_electrodes: Option<Vec<u32>>,
}

/// A parameter-set file for `add-params`.
#[derive(Debug, Deserialize)]
pub struct ParamsFile {
    pub clustering_method: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub paramset_idx: Option<i64>,
    pub params: Value,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub probes: usize,
    pub electrode_configs: usize,
    pub sessions: usize,
    pub assignments: usize,
    pub tasks: usize,
}

fn default_insertion() -> i64 {
    1
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Insert everything in `manifest`. Re-importing is harmless: sessions, configurations
/// and tasks already present are kept, probes and probe assignments are updated in place.
pub fn import(db: &Database, manifest: &Manifest) -> Result<ImportSummary, Error> {
    let mut summary = ImportSummary::default();

    for p in &manifest.probes {
        db.insert_probe(p)?;
        summary.probes += 1;
    }
    for entry in &manifest.electrode_configs {
        let config = ElectrodeConfig::new(entry.probe_type.clone(), entry.electrodes.clone());
        db.insert_electrode_config(&config)?;
        summary.electrode_configs += 1;
    }

    for entry in &manifest.sessions {
        if entry.end_time <= entry.start_time {
            return Err(Error::Validation(format!(
                "session {} starting {} ends before it starts",
                entry.experiment_ref, entry.start_time
            )));
        }
        if !entry.paramsets.is_empty() && !entry.session_type.has_spike_sorting() {
            return Err(Error::Validation(format!(
                "session {} starting {} is a {} session; clustering tasks need spike_sorting or both",
                entry.experiment_ref,
                entry.start_time,
                entry.session_type.as_str()
            )));
        }
        let session_id = db.insert_session(&Session {
            id: 0,
            experiment_ref: entry.experiment_ref.clone(),
            insertion_number: entry.insertion_number,
            start_time: entry.start_time,
            end_time: entry.end_time,
            session_type: entry.session_type,
        })?;
        summary.sessions += 1;

        if let Some(assignment) = &entry.probe {
            check_assignment(db, assignment)?;
            db.insert_probe_assignment(&ProbeAssignment {
                session_id,
                probe_id: assignment.probe_id.clone(),
                port: assignment.port,
                used_electrodes: assignment.used_electrodes.clone(),
            })?;
            summary.assignments += 1;
        }

        for idx in &entry.paramsets {
            if db.parameter_set(*idx)?.is_none() {
                return Err(Error::NotFound(format!("parameter set {}", idx)));
            }
            let task_id = db.insert_clustering_task(session_id, *idx, None)?;
            debug!("Session {} queued as task {} with paramset {}", session_id, task_id, idx);
            summary.tasks += 1;
        }
    }

    info!(
        "Imported {} probes, {} electrode configs, {} sessions, {} assignments, {} tasks",
        summary.probes,
        summary.electrode_configs,
        summary.sessions,
        summary.assignments,
        summary.tasks
    );
    Ok(summary)
}

/// The probe must exist and any used electrodes must belong to its configuration.
fn check_assignment(db: &Database, assignment: &AssignmentEntry) -> Result<(), Error> {
    let probe = db
        .get_probe(&assignment.probe_id)?
        .ok_or_else(|| Error::NotFound(format!("probe '{}'", assignment.probe_id)))?;
    if let Some(config) = db.electrode_config(&probe.probe_type)? {
        probe::resolve(&config, assignment.port, assignment.used_electrodes.as_deref())?;
    }
    Ok(())
}

pub fn add_params(db: &Database, file: &ParamsFile) -> Result<i64, Error> {
    insert_parameter_set(
        db,
        &file.clustering_method,
        &file.description,
        &file.params,
        file.paramset_idx,
    )
}
