//! Probe geometry: electrode configurations and the channel/electrode resolver.

pub mod channel_map;

pub use channel_map::{qualified_channel_id, resolve, ChannelMap, ContactMap, RowBinding};

use crate::digest;
use crate::error::Error;
use crate::storage::models::ProbeAssignment;
use crate::storage::Database;
use serde::{Deserialize, Serialize};

/// One recording site of a probe type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Electrode {
    pub electrode: u32,
    /// Acquisition-order position within the probe, independent of the port.
    pub channel_idx: u32,
    #[serde(default)]
    pub shank: u32,
    #[serde(default)]
    pub x_coord: f64,
    #[serde(default)]
    pub y_coord: f64,
}

/// Every electrode of a probe type. One configuration per probe type.
#[derive(Debug, Clone, PartialEq)]
pub struct ElectrodeConfig {
    pub probe_type: String,
    pub electrode_config_hash: String,
    pub electrodes: Vec<Electrode>,
}

impl ElectrodeConfig {
    pub fn new(probe_type: impl Into<String>, electrodes: Vec<Electrode>) -> Self {
        let electrode_config_hash = config_hash(&electrodes);
        Self {
            probe_type: probe_type.into(),
            electrode_config_hash,
            electrodes,
        }
    }

    pub fn electrode(&self, id: u32) -> Option<&Electrode> {
        self.electrodes.iter().find(|e| e.electrode == id)
    }
}

/// Deterministic hash over the sorted (electrode, channel_idx) pairs.
pub fn config_hash(electrodes: &[Electrode]) -> String {
    let mut pairs: Vec<(u32, u32)> = electrodes
        .iter()
        .map(|e| (e.electrode, e.channel_idx))
        .collect();
    pairs.sort_unstable();

    let mut bytes = Vec::with_capacity(pairs.len() * 8);
    for (electrode, channel_idx) in pairs {
        bytes.extend_from_slice(&electrode.to_le_bytes());
        bytes.extend_from_slice(&channel_idx.to_le_bytes());
    }
    digest::xxh3_hex(&bytes)
}

/// The probe assignment of a session and the electrode configuration of its probe type.
pub fn session_geometry(
    db: &Database,
    session_id: i64,
) -> Result<(ProbeAssignment, ElectrodeConfig), Error> {
    let assignment = db.probe_assignment(session_id)?.ok_or_else(|| {
        Error::NotFound(format!("probe assignment for session {}", session_id))
    })?;
    let probe = db
        .get_probe(&assignment.probe_id)?
        .ok_or_else(|| Error::NotFound(format!("probe '{}'", assignment.probe_id)))?;
    let config = db.electrode_config(&probe.probe_type)?.ok_or_else(|| {
        Error::Consistency(format!(
            "no electrode config for probe type '{}'",
            probe.probe_type
        ))
    })?;
    Ok((assignment, config))
}
