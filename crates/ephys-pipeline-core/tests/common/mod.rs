#![allow(dead_code)]

use chrono::{Duration, NaiveDate, NaiveDateTime};
use ephys_pipeline_core::config::JobConfig;
use ephys_pipeline_core::probe::{Electrode, ElectrodeConfig};
use ephys_pipeline_core::reader::{AmplifierChannel, RawHeader, RawReader, RawRecording};
use ephys_pipeline_core::sorting::{Analyzer, RecordingRequest, SorterId, SortingEngine};
use ephys_pipeline_core::storage::models::{
    AcquisitionSoftware, ExportKind, Port, Probe, ProbeAssignment, RawFile, Session, SessionType,
};
use ephys_pipeline_core::storage::Database;
use ephys_pipeline_core::{ConfiguredLocator, Error};
use ndarray::Array2;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub const PROBE_TYPE: &str = "H6";
pub const PROBE_ID: &str = "probe-17";

pub fn day_start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 5)
        .unwrap()
        .and_hms_opt(14, 0, 0)
        .unwrap()
}

pub fn session(start: NaiveDateTime, seconds: i64, session_type: SessionType) -> Session {
    Session {
        id: 0,
        experiment_ref: "O09".to_string(),
        insertion_number: 1,
        start_time: start,
        end_time: start + Duration::seconds(seconds),
        session_type,
    }
}

/// Raw-data root, processed root and the locator over them.
pub struct Workspace {
    pub dir: tempfile::TempDir,
    pub raw_root: PathBuf,
    pub processed_root: PathBuf,
    pub locator: ConfiguredLocator,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let raw_root = dir.path().join("raw");
        let processed_root = dir.path().join("processed");
        fs::create_dir_all(&raw_root).unwrap();
        fs::create_dir_all(&processed_root).unwrap();
        let locator =
            ConfiguredLocator::new(vec![raw_root.clone()], Some(processed_root.clone())).unwrap();
        Self {
            dir,
            raw_root,
            processed_root,
            locator,
        }
    }

    /// Create an Intan file on disk and return its catalog row.
    pub fn intan_file(&self, prefix: &str, time: NaiveDateTime) -> RawFile {
        self.raw_file(prefix, time, AcquisitionSoftware::Intan, "rhd")
    }

    pub fn raw_file(
        &self,
        prefix: &str,
        time: NaiveDateTime,
        software: AcquisitionSoftware,
        extension: &str,
    ) -> RawFile {
        let name = format!("{}_{}.{}", prefix, time.format("%y%m%d_%H%M%S"), extension);
        let relative = Path::new(prefix).join(&name);
        let full = self.raw_root.join(&relative);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(&full, b"raw").unwrap();
        RawFile {
            id: 0,
            file_path: relative.to_string_lossy().into_owned(),
            acq_software: software,
            file_time: time,
            parent_folder: prefix.to_string(),
            filename_prefix: prefix.to_string(),
        }
    }
}

/// Electrodes `first..first+count` on channels given by `channel_of(i)`.
pub fn electrode_config(count: u32, channel_of: impl Fn(u32) -> u32) -> ElectrodeConfig {
    let electrodes = (0..count)
        .map(|i| Electrode {
            electrode: 100 + i,
            channel_idx: channel_of(i),
            shank: 0,
            x_coord: 0.0,
            y_coord: 20.0 * i as f64,
        })
        .collect();
    ElectrodeConfig::new(PROBE_TYPE, electrodes)
}

/// Register the probe, its configuration and the session's assignment.
pub fn assign_probe(
    db: &Database,
    session_id: i64,
    config: &ElectrodeConfig,
    port: Port,
    used_electrodes: Option<Vec<u32>>,
) {
    db.insert_probe(&Probe {
        probe_id: PROBE_ID.to_string(),
        probe_type: config.probe_type.clone(),
    })
    .unwrap();
    db.insert_electrode_config(config).unwrap();
    db.insert_probe_assignment(&ProbeAssignment {
        session_id,
        probe_id: PROBE_ID.to_string(),
        port,
        used_electrodes,
    })
    .unwrap();
}

pub fn header(sample_rate: f64, ports: &[(Port, usize)]) -> RawHeader {
    let amplifier_channels = ports
        .iter()
        .flat_map(|(port, count)| {
            (0..*count).map(move |i| AmplifierChannel {
                port_prefix: port.as_str().to_string(),
                native_channel_name: format!("{}-{:03}", port.as_str(), i),
            })
        })
        .collect();
    RawHeader {
        sample_rate,
        notch_filter_frequency: None,
        amplifier_channels,
        extra: serde_json::Map::new(),
    }
}

/// Synthetic reader: every file has the same header. Row `r` carries a 10 Hz sine of
/// amplitude `r + 1` plus 60 Hz mains hum of amplitude 50.
pub struct FakeReader {
    pub header: RawHeader,
    pub samples_per_file: usize,
    pub opens: AtomicUsize,
    /// Per-file sample-rate overrides, keyed by file name.
    pub rate_overrides: HashMap<String, f64>,
}

impl FakeReader {
    pub fn new(header: RawHeader, samples_per_file: usize) -> Self {
        Self {
            header,
            samples_per_file,
            opens: AtomicUsize::new(0),
            rate_overrides: HashMap::new(),
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn header_for(&self, file: &Path) -> RawHeader {
        let mut header = self.header.clone();
        let name = file.file_name().unwrap().to_string_lossy().into_owned();
        if let Some(rate) = self.rate_overrides.get(&name) {
            header.sample_rate = *rate;
        }
        header
    }
}

impl RawReader for FakeReader {
    fn read_header(&self, file: &Path) -> Result<RawHeader, Error> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !file.exists() {
            return Err(Error::RawRead {
                path: file.to_path_buf(),
                message: "missing".to_string(),
            });
        }
        Ok(self.header_for(file))
    }

    fn load_file(&self, file: &Path) -> Result<RawRecording, Error> {
        let header = self.read_header(file)?;
        let fs = header.sample_rate;
        let rows = header.amplifier_channels.len();
        let samples = Array2::from_shape_fn((rows, self.samples_per_file), |(r, t)| {
            let time = t as f64 / fs;
            let signal = (r as f64 + 1.0) * (2.0 * PI * 10.0 * time).sin();
            let hum = 50.0 * (2.0 * PI * 60.0 * time).sin();
            (signal + hum) as f32
        });
        Ok(RawRecording { header, samples })
    }
}

/// Analyzer with two units over four contacts.
#[derive(Debug, Clone)]
pub struct FakeAnalyzer {
    pub dir: PathBuf,
    pub contact_ids: Vec<u32>,
    /// Spike-location count override for unit 2, to break array alignment.
    pub unit2_locations: usize,
}

impl Analyzer for FakeAnalyzer {
    fn unit_ids(&self) -> Result<Vec<i64>, Error> {
        Ok(vec![1, 2])
    }

    fn contact_ids(&self) -> Result<Vec<u32>, Error> {
        Ok(self.contact_ids.clone())
    }

    fn best_channels(&self, k: usize) -> Result<BTreeMap<i64, Vec<usize>>, Error> {
        assert_eq!(k, 1);
        Ok(BTreeMap::from([(1, vec![0]), (2, vec![2])]))
    }

    fn spike_count(&self, unit_id: i64) -> Result<usize, Error> {
        Ok(self.spike_times(unit_id)?.len())
    }

    fn spike_times(&self, unit_id: i64) -> Result<Vec<f64>, Error> {
        Ok(match unit_id {
            1 => vec![0.1, 0.2, 0.3],
            _ => vec![0.15, 0.25],
        })
    }

    fn spike_channels(&self, unit_id: i64) -> Result<Vec<usize>, Error> {
        Ok(match unit_id {
            1 => vec![0, 0, 1],
            _ => vec![2, 3],
        })
    }

    fn spike_locations(&self, unit_id: i64) -> Result<Vec<[f64; 2]>, Error> {
        Ok(match unit_id {
            1 => vec![[0.0, 10.0], [0.0, 12.0], [1.0, 14.0]],
            _ => (0..self.unit2_locations)
                .map(|i| [0.0, 40.0 + i as f64])
                .collect(),
        })
    }

    fn quality_label(&self, unit_id: i64) -> Result<Option<String>, Error> {
        Ok((unit_id == 1).then(|| "good".to_string()))
    }

    fn metrics(&self) -> Result<BTreeMap<i64, BTreeMap<String, f64>>, Error> {
        let row = |rate: f64, drift: f64| {
            BTreeMap::from([
                ("firing_rate".to_string(), rate),
                ("amplitude_median".to_string(), 80.0),
                ("drift_ptp".to_string(), drift),
            ])
        };
        Ok(BTreeMap::from([(1, row(3.0, 1.5)), (2, row(2.0, f64::INFINITY))]))
    }

    fn unit_template(&self, unit_id: i64) -> Result<Array2<f64>, Error> {
        let channels = self.contact_ids.len();
        Ok(Array2::from_shape_fn((5, channels), |(s, c)| {
            unit_id as f64 * 100.0 + c as f64 * 10.0 + s as f64
        }))
    }
}

/// Sorting engine that writes small marker files and counts its invocations.
pub struct FakeEngine {
    pub contact_ids: Vec<u32>,
    pub unit2_locations: usize,
    pub computable: Vec<String>,
    pub recordings: AtomicUsize,
    pub sorter_runs: AtomicUsize,
    pub analyzers: AtomicUsize,
    pub exports: AtomicUsize,
    pub fail_sorting: bool,
    pub computed_extensions: Mutex<Vec<String>>,
    pub last_request: Mutex<Option<RecordingRequest>>,
}

impl FakeEngine {
    pub fn new(contact_ids: Vec<u32>) -> Self {
        Self {
            contact_ids,
            unit2_locations: 2,
            computable: vec![
                "random_spikes".to_string(),
                "templates".to_string(),
                "spike_locations".to_string(),
                "quality_metrics".to_string(),
            ],
            recordings: AtomicUsize::new(0),
            sorter_runs: AtomicUsize::new(0),
            analyzers: AtomicUsize::new(0),
            exports: AtomicUsize::new(0),
            fail_sorting: false,
            computed_extensions: Mutex::new(Vec::new()),
            last_request: Mutex::new(None),
        }
    }

    pub fn sorter_runs(&self) -> usize {
        self.sorter_runs.load(Ordering::SeqCst)
    }

    fn analyzer(&self, dir: &Path) -> FakeAnalyzer {
        FakeAnalyzer {
            dir: dir.to_path_buf(),
            contact_ids: self.contact_ids.clone(),
            unit2_locations: self.unit2_locations,
        }
    }
}

impl SortingEngine for FakeEngine {
    type Analyzer = FakeAnalyzer;

    fn build_recording(
        &self,
        request: &RecordingRequest,
        dest: &Path,
        _jobs: &JobConfig,
    ) -> Result<(), Error> {
        self.recordings.fetch_add(1, Ordering::SeqCst);
        fs::write(dest.join("recording.json"), serde_json::to_vec(request)?)?;
        *self.last_request.lock().unwrap() = Some(request.clone());
        Ok(())
    }

    fn run_sorter(
        &self,
        recording: &Path,
        sorter: SorterId,
        _params: &Value,
        dest: &Path,
        _jobs: &JobConfig,
    ) -> Result<(), Error> {
        let run = self.sorter_runs.fetch_add(1, Ordering::SeqCst) + 1;
        assert!(recording.join("recording.json").exists());
        if self.fail_sorting {
            fs::write(dest.join("partial.npy"), b"half")?;
            return Err(Error::Engine(format!("{} crashed", sorter.sorter_name())));
        }
        fs::write(dest.join("spike_times.npy"), format!("run {}", run))?;
        Ok(())
    }

    fn create_analyzer(
        &self,
        _recording: &Path,
        sorting: &Path,
        dest: &Path,
        _jobs: &JobConfig,
    ) -> Result<FakeAnalyzer, Error> {
        self.analyzers.fetch_add(1, Ordering::SeqCst);
        assert!(sorting.join("spike_times.npy").exists());
        fs::write(dest.join("analyzer.json"), b"{}")?;
        Ok(self.analyzer(dest))
    }

    fn list_computable_extensions(&self, _analyzer: &FakeAnalyzer) -> Result<Vec<String>, Error> {
        Ok(self.computable.clone())
    }

    fn compute_extension(
        &self,
        analyzer: &FakeAnalyzer,
        name: &str,
        _params: &Value,
        _jobs: &JobConfig,
    ) -> Result<(), Error> {
        fs::create_dir_all(analyzer.dir.join("extensions"))?;
        fs::write(analyzer.dir.join("extensions").join(name), b"ok")?;
        self.computed_extensions.lock().unwrap().push(name.to_string());
        Ok(())
    }

    fn export(
        &self,
        _analyzer: &FakeAnalyzer,
        kind: ExportKind,
        dest: &Path,
        _jobs: &JobConfig,
    ) -> Result<(), Error> {
        self.exports.fetch_add(1, Ordering::SeqCst);
        match kind {
            ExportKind::Phy => {
                fs::write(dest.join("params.py"), b"dat_path = 'recording.dat'")?;
                fs::write(dest.join("spike_times.npy"), b"x")?;
            }
            ExportKind::Report => {
                fs::create_dir_all(dest.join("units"))?;
                fs::write(dest.join("quality metrics.csv"), b"x")?;
                fs::write(dest.join("units").join("1.png"), b"x")?;
            }
        }
        Ok(())
    }

    fn load_analyzer(&self, dir: &Path) -> Result<FakeAnalyzer, Error> {
        if !dir.join("analyzer.json").exists() {
            return Err(Error::NotFound(format!("analyzer {}", dir.display())));
        }
        Ok(self.analyzer(dir))
    }
}
