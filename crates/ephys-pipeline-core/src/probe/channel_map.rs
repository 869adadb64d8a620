use super::ElectrodeConfig;
use crate::error::Error;
use crate::reader::AmplifierChannel;
use crate::storage::models::Port;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

/// Channel identifier as it appears in raw headers, e.g. `A-005`.
pub fn qualified_channel_id(port: Port, channel_idx: u32) -> String {
    format!("{}-{:03}", port.as_str(), channel_idx)
}

/// Bijection between a probe's channel indices and electrode identities for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMap {
    port: Port,
    /// channel_idx -> electrode
    channels: BTreeMap<u32, u32>,
}

/// A raw sample-matrix row and the electrode recorded on it.
#[derive(Debug, Clone, PartialEq)]
pub struct RowBinding {
    pub row: usize,
    pub channel_id: String,
    pub electrode: u32,
}

/// Analyzer channel index -> electrode, built from a recording's ordered contact ids.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactMap {
    electrodes: Vec<u32>,
}

/// Map a probe's channels to electrodes, restricted to `used_electrodes` when given.
///
/// An empty selection is the same as no selection. Selected electrodes missing from the
/// configuration are rejected rather than dropped.
pub fn resolve(
    config: &ElectrodeConfig,
    port: Port,
    used_electrodes: Option<&[u32]>,
) -> Result<ChannelMap, Error> {
    if config.electrodes.is_empty() {
        return Err(Error::Consistency(format!(
            "electrode config for probe type '{}' has no electrodes",
            config.probe_type
        )));
    }

    let selection: Option<HashSet<u32>> = match used_electrodes {
        Some(ids) if !ids.is_empty() => {
            if let Some(missing) = ids.iter().find(|id| config.electrode(**id).is_none()) {
                return Err(Error::Validation(format!(
                    "used electrode {} is not part of probe type '{}'",
                    missing, config.probe_type
                )));
            }
            Some(ids.iter().copied().collect())
        }
        _ => None,
    };

    let mut channels = BTreeMap::new();
    for electrode in &config.electrodes {
        if let Some(selected) = &selection {
            if !selected.contains(&electrode.electrode) {
                continue;
            }
        }
        if channels
            .insert(electrode.channel_idx, electrode.electrode)
            .is_some()
        {
            return Err(Error::Consistency(format!(
                "channel {} appears twice in electrode config for '{}'",
                electrode.channel_idx, config.probe_type
            )));
        }
    }

    debug!(
        "Resolved {} of {} electrodes for probe type '{}' on port {}",
        channels.len(),
        config.electrodes.len(),
        config.probe_type,
        port
    );
    Ok(ChannelMap { port, channels })
}

impl ChannelMap {
    pub fn port(&self) -> Port {
        self.port
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// (channel_idx, electrode) pairs in channel order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.channels.iter().map(|(c, e)| (*c, *e))
    }

    /// Electrodes in channel order.
    pub fn electrodes(&self) -> Vec<u32> {
        self.channels.values().copied().collect()
    }

    pub fn electrode_for_channel(&self, channel_idx: u32) -> Option<u32> {
        self.channels.get(&channel_idx).copied()
    }

    pub fn channel_for_electrode(&self, electrode: u32) -> Option<u32> {
        self.channels
            .iter()
            .find(|(_, e)| **e == electrode)
            .map(|(c, _)| *c)
    }

    /// Bind the mapping to the rows of a raw sample matrix.
    ///
    /// `header_channels` is the full hardware-ordered channel list of a raw file; only
    /// the channels on this map's port are considered, and `channel_idx` indexes into
    /// that port-filtered list. Bindings come back sorted by row.
    pub fn bind_rows(&self, header_channels: &[AmplifierChannel]) -> Result<Vec<RowBinding>, Error> {
        let port_rows: Vec<(usize, &AmplifierChannel)> = header_channels
            .iter()
            .enumerate()
            .filter(|(_, ch)| ch.is_on_port(self.port))
            .collect();

        let mut bindings = Vec::with_capacity(self.channels.len());
        for (channel_idx, electrode) in self.iter() {
            let (row, channel) = port_rows.get(channel_idx as usize).ok_or_else(|| {
                Error::Consistency(format!(
                    "channel {} requested but port {} only has {} channels",
                    channel_idx,
                    self.port,
                    port_rows.len()
                ))
            })?;
            let channel_id = qualified_channel_id(self.port, channel_idx);
            if channel.native_channel_name != channel_id {
                warn!(
                    "Header channel at row {} is named '{}', expected '{}'",
                    row, channel.native_channel_name, channel_id
                );
            }
            bindings.push(RowBinding {
                row: *row,
                channel_id,
                electrode,
            });
        }
        bindings.sort_by_key(|binding| binding.row);
        Ok(bindings)
    }

    /// Map analyzer channel positions to electrodes via the recording's contact ids
    /// (which are probe channel indices).
    pub fn bind_contacts(&self, contact_ids: &[u32]) -> Result<ContactMap, Error> {
        let electrodes = contact_ids
            .iter()
            .map(|contact| {
                self.electrode_for_channel(*contact).ok_or_else(|| {
                    Error::Consistency(format!(
                        "contact {} has no electrode in the channel map",
                        contact
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ContactMap { electrodes })
    }
}

impl ContactMap {
    pub fn electrode(&self, analyzer_channel: usize) -> Result<u32, Error> {
        self.electrodes.get(analyzer_channel).copied().ok_or_else(|| {
            Error::Consistency(format!(
                "analyzer channel {} out of range ({} contacts)",
                analyzer_channel,
                self.electrodes.len()
            ))
        })
    }

    pub fn electrodes(&self) -> &[u32] {
        &self.electrodes
    }

    pub fn len(&self) -> usize {
        self.electrodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.electrodes.is_empty()
    }
}
