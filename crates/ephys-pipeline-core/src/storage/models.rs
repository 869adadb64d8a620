use crate::error::Error;
use crate::sorting::stage::Stage;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Acquisition systems the catalog and the recording builder know how to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AcquisitionSoftware {
    #[serde(rename = "SpikeGLX")]
    SpikeGlx,
    #[serde(rename = "Open Ephys")]
    OpenEphys,
    #[serde(rename = "Intan")]
    Intan,
}

impl AcquisitionSoftware {
    pub const ALL: [AcquisitionSoftware; 3] = [
        AcquisitionSoftware::SpikeGlx,
        AcquisitionSoftware::OpenEphys,
        AcquisitionSoftware::Intan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionSoftware::SpikeGlx => "SpikeGLX",
            AcquisitionSoftware::OpenEphys => "Open Ephys",
            AcquisitionSoftware::Intan => "Intan",
        }
    }
}

impl FromStr for AcquisitionSoftware {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AcquisitionSoftware::ALL
            .into_iter()
            .find(|software| software.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::Unsupported(format!("acquisition software '{}'", s)))
    }
}

/// Headstage port a probe is plugged into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Port {
    A,
    B,
    C,
    D,
}

impl Port {
    pub fn as_str(&self) -> &'static str {
        match self {
            Port::A => "A",
            Port::B => "B",
            Port::C => "C",
            Port::D => "D",
        }
    }
}

impl FromStr for Port {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "A" => Ok(Port::A),
            "B" => Ok(Port::B),
            "C" => Ok(Port::C),
            "D" => Ok(Port::D),
            other => Err(Error::Validation(format!("invalid port id '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Lfp,
    SpikeSorting,
    Both,
    Test,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Lfp => "lfp",
            SessionType::SpikeSorting => "spike_sorting",
            SessionType::Both => "both",
            SessionType::Test => "test",
        }
    }

    /// Whether clustering tasks may run against sessions of this type.
    pub fn has_spike_sorting(&self) -> bool {
        matches!(self, SessionType::SpikeSorting | SessionType::Both)
    }
}

impl FromStr for SessionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lfp" => Ok(SessionType::Lfp),
            "spike_sorting" => Ok(SessionType::SpikeSorting),
            "both" => Ok(SessionType::Both),
            "test" => Ok(SessionType::Test),
            other => Err(Error::Validation(format!("invalid session type '{}'", other))),
        }
    }
}

macro_rules! text_enum_sql {
    ($($ty:ty),*) => {
        $(
            impl ToSql for $ty {
                fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                    Ok(ToSqlOutput::from(self.as_str()))
                }
            }

            impl FromSql for $ty {
                fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                    value
                        .as_str()?
                        .parse()
                        .map_err(|e: Error| FromSqlError::Other(Box::new(e)))
                }
            }

            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }
        )*
    };
}

text_enum_sql!(AcquisitionSoftware, Port, SessionType, Stage, ExportKind);

/// A raw acquisition file. Immutable once cataloged.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFile {
    pub id: i64,
    /// Path relative to the raw-data root it was found under.
    pub file_path: String,
    pub acq_software: AcquisitionSoftware,
    pub file_time: NaiveDateTime,
    pub parent_folder: String,
    pub filename_prefix: String,
}

/// A user-declared recording window.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: i64,
    pub experiment_ref: String,
    pub insertion_number: i64,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub session_type: SessionType,
}

impl Session {
    pub fn duration_minutes(&self) -> f64 {
        (self.end_time - self.start_time).num_milliseconds() as f64 / 60_000.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub probe_id: String,
    pub probe_type: String,
}

/// Which probe was used in a session, on which port, and which of its electrodes.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeAssignment {
    pub session_id: i64,
    pub probe_id: String,
    pub port: Port,
    /// `None` means every electrode of the probe's configuration.
    pub used_electrodes: Option<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSet {
    pub paramset_idx: i64,
    pub clustering_method: String,
    pub description: String,
    pub content_hash: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusteringTask {
    pub id: i64,
    pub session_id: i64,
    pub paramset_idx: i64,
    /// Relative to the processed root, or absolute when user-supplied. Empty until inferred.
    pub output_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub task_id: i64,
    pub stage: Stage,
    pub execution_time: DateTime<Utc>,
    /// Hours.
    pub execution_duration: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LfpResult {
    pub session_id: i64,
    pub lfp_sampling_rate: f64,
    /// Hours.
    pub execution_duration: f64,
    pub electrode_config_hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LfpTrace {
    pub electrode: u32,
    /// Microvolts at `lfp_sampling_rate`.
    pub samples: Vec<f32>,
}

/// One sorted unit projected onto electrode identities.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitRecord {
    pub unit_id: i64,
    pub peak_electrode: u32,
    pub quality_label: String,
    pub spike_count: usize,
    /// Seconds from recording start.
    pub spike_times: Vec<f64>,
    pub spike_sites: Vec<u32>,
    /// Microns from the probe origin.
    pub spike_depths: Vec<f64>,
}

/// Cluster-quality metric columns, in storage order.
pub const CLUSTER_METRIC_COLUMNS: [&str; 15] = [
    "firing_rate",
    "snr",
    "presence_ratio",
    "isi_violation",
    "number_violation",
    "amplitude_cutoff",
    "isolation_distance",
    "l_ratio",
    "d_prime",
    "nn_hit_rate",
    "nn_miss_rate",
    "silhouette_score",
    "max_drift",
    "cumulative_drift",
    "contamination_rate",
];

/// Waveform-shape metric columns, in storage order.
pub const WAVEFORM_METRIC_COLUMNS: [&str; 9] = [
    "amplitude",
    "duration",
    "halfwidth",
    "pt_ratio",
    "repolarization_slope",
    "recovery_slope",
    "spread",
    "velocity_above",
    "velocity_below",
];

/// Canonical per-unit metrics; missing or non-finite values are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitMetrics {
    pub unit_id: i64,
    pub values: Vec<(&'static str, Option<f64>)>,
}

impl UnitMetrics {
    pub fn get(&self, column: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(name, _)| *name == column)
            .and_then(|(_, value)| *value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitWaveforms {
    pub unit_id: i64,
    pub peak_electrode: u32,
    pub peak_electrode_waveform: Vec<f32>,
    /// (electrode, mean waveform) for every electrode of the recording.
    pub electrode_waveforms: Vec<(u32, Vec<f32>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportKind {
    Report,
    Phy,
}

impl ExportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportKind::Report => "report",
            ExportKind::Phy => "phy",
        }
    }

    /// Folder name under the sorter directory.
    pub fn folder_name(&self) -> &'static str {
        match self {
            ExportKind::Report => "spikeinterface_report",
            ExportKind::Phy => "phy",
        }
    }
}

impl FromStr for ExportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "report" => Ok(ExportKind::Report),
            "phy" => Ok(ExportKind::Phy),
            other => Err(Error::Validation(format!("invalid export kind '{}'", other))),
        }
    }
}
