//! Raw acquisition reader seam. Vendor binary parsing lives behind [`RawReader`].

use crate::error::Error;
use crate::storage::models::Port;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One amplifier channel as listed in a raw file header, in hardware order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmplifierChannel {
    /// Port the channel arrived on, e.g. "A".
    pub port_prefix: String,
    /// Vendor channel name, conventionally `{port}-{index:03}`.
    pub native_channel_name: String,
}

impl AmplifierChannel {
    pub fn is_on_port(&self, port: Port) -> bool {
        self.port_prefix == port.as_str()
    }
}

/// Header fields the pipeline relies on. Everything else the vendor reports is kept
/// verbatim in `extra` for session info.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawHeader {
    pub sample_rate: f64,
    /// Powerline frequency the hardware notch was configured for, if any.
    #[serde(default)]
    pub notch_filter_frequency: Option<f64>,
    pub amplifier_channels: Vec<AmplifierChannel>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A fully loaded raw file: header plus a (channel x sample) matrix in microvolts.
#[derive(Debug, Clone)]
pub struct RawRecording {
    pub header: RawHeader,
    pub samples: Array2<f32>,
}

impl RawRecording {
    pub fn channel_count(&self) -> usize {
        self.samples.nrows()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.ncols()
    }
}

pub trait RawReader: Send + Sync {
    fn read_header(&self, file: &Path) -> Result<RawHeader, Error>;

    fn load_file(&self, file: &Path) -> Result<RawRecording, Error>;

    /// Load only `rows` of a file's matrix, in the given order.
    ///
    /// Readers that can seek per channel should override this; the default loads the
    /// whole file and slices it.
    fn load_rows(&self, file: &Path, rows: &[usize]) -> Result<(RawHeader, Array2<f32>), Error> {
        let recording = self.load_file(file)?;
        let channel_count = recording.channel_count();
        if let Some(&bad) = rows.iter().find(|&&row| row >= channel_count) {
            return Err(Error::Consistency(format!(
                "{} has {} channels, row {} requested",
                file.display(),
                channel_count,
                bad
            )));
        }
        let sliced = recording.samples.select(ndarray::Axis(0), rows);
        Ok((recording.header, sliced))
    }
}
