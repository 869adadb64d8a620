//! Process bridge to the external reader and sorting engine.
//!
//! Every call runs `<command...> <operation>`, writes one JSON request to the child's
//! stdin and parses one JSON response from its stdout. Sample matrices come back through
//! a scratch file of little-endian f32 values, row-major, whose path is in the request.

use ephys_pipeline_core::config::{BridgeConfig, JobConfig};
use ephys_pipeline_core::reader::{RawHeader, RawReader, RawRecording};
use ephys_pipeline_core::sorting::{Analyzer, RecordingRequest, SorterId, SortingEngine};
use ephys_pipeline_core::storage::models::ExportKind;
use ephys_pipeline_core::Error;
use ndarray::Array2;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Bridge {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

/// Shape of a matrix the bridge wrote to the scratch file.
#[derive(Debug, Deserialize)]
struct MatrixResponse {
    shape: [usize; 2],
}

#[derive(Debug, Deserialize)]
struct LoadResponse {
    header: RawHeader,
    shape: [usize; 2],
}

impl Bridge {
    pub fn from_config(bridge_config: &BridgeConfig) -> Result<Self, Error> {
        let (program, args) = bridge_config.command.split_first().ok_or_else(|| {
            Error::Config(config::ConfigError::Message(
                "bridge.command must name a program".to_string(),
            ))
        })?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            working_dir: bridge_config.working_dir.as_ref().map(PathBuf::from),
        })
    }

    pub fn call<T: DeserializeOwned>(&self, operation: &str, request: &Value) -> Result<T, Error> {
        let started = Instant::now();
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(operation)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            Error::Engine(format!("failed to start bridge '{}': {}", self.program, e))
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            serde_json::to_writer(&mut stdin, request)?;
            stdin.flush()?;
        }
        let output = child.wait_with_output()?;
        debug!(
            "Bridge {} finished in {:.2}s with {}",
            operation,
            started.elapsed().as_secs_f64(),
            output.status
        );

        if !output.status.success() {
            return Err(Error::Engine(format!(
                "bridge {} exited with {}: {}",
                operation,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::from_value(Value::Null)?);
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    fn call_unit(&self, operation: &str, request: &Value) -> Result<(), Error> {
        let _: Value = self.call(operation, request)?;
        Ok(())
    }
}

fn scratch_file() -> Result<tempfile::NamedTempFile, Error> {
    Ok(tempfile::Builder::new()
        .prefix("ephys-bridge-")
        .suffix(".f32")
        .tempfile()?)
}

/// Read a row-major `rows x cols` matrix of little-endian f32 values.
pub fn read_f32_matrix(path: &Path, shape: [usize; 2]) -> Result<Array2<f32>, Error> {
    let bytes = fs::read(path)?;
    let expected = shape[0] * shape[1] * 4;
    if bytes.len() != expected {
        return Err(Error::Consistency(format!(
            "{} holds {} bytes, expected {} for a {}x{} f32 matrix",
            path.display(),
            bytes.len(),
            expected,
            shape[0],
            shape[1]
        )));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Array2::from_shape_vec((shape[0], shape[1]), values)
        .map_err(|e| Error::Consistency(e.to_string()))
}

// ── Reader ──────────────────────────────────────────────────────

pub struct BridgeReader {
    bridge: Bridge,
}

impl BridgeReader {
    pub fn new(bridge: Bridge) -> Self {
        Self { bridge }
    }

    fn load(&self, file: &Path, rows: Option<&[usize]>) -> Result<(RawHeader, Array2<f32>), Error> {
        let scratch = scratch_file()?;
        let response: LoadResponse = self
            .bridge
            .call(
                "load_rows",
                &json!({
                    "file": file.to_string_lossy(),
                    "rows": rows,
                    "output": scratch.path().to_string_lossy(),
                }),
            )
            .map_err(|e| Error::RawRead {
                path: file.to_path_buf(),
                message: e.to_string(),
            })?;
        let samples = read_f32_matrix(scratch.path(), response.shape)?;
        Ok((response.header, samples))
    }
}

impl RawReader for BridgeReader {
    fn read_header(&self, file: &Path) -> Result<RawHeader, Error> {
        self.bridge
            .call("read_header", &json!({ "file": file.to_string_lossy() }))
            .map_err(|e| Error::RawRead {
                path: file.to_path_buf(),
                message: e.to_string(),
            })
    }

    fn load_file(&self, file: &Path) -> Result<RawRecording, Error> {
        let (header, samples) = self.load(file, None)?;
        Ok(RawRecording { header, samples })
    }

    fn load_rows(&self, file: &Path, rows: &[usize]) -> Result<(RawHeader, Array2<f32>), Error> {
        self.load(file, Some(rows))
    }
}

// ── Sorting engine ──────────────────────────────────────────────

pub struct BridgeEngine {
    bridge: Bridge,
}

impl BridgeEngine {
    pub fn new(bridge: Bridge) -> Self {
        Self { bridge }
    }
}

impl SortingEngine for BridgeEngine {
    type Analyzer = BridgeAnalyzer;

    fn build_recording(
        &self,
        request: &RecordingRequest,
        dest: &Path,
        jobs: &JobConfig,
    ) -> Result<(), Error> {
        let request = serde_json::to_value(request)?;
        self.bridge.call_unit(
            "build_recording",
            &json!({ "request": request, "dest": dest.to_string_lossy(), "jobs": jobs }),
        )
    }

    fn run_sorter(
        &self,
        recording: &Path,
        sorter: SorterId,
        params: &Value,
        dest: &Path,
        jobs: &JobConfig,
    ) -> Result<(), Error> {
        self.bridge.call_unit(
            "run_sorter",
            &json!({
                "recording": recording.to_string_lossy(),
                "sorter": sorter.sorter_name(),
                "params": params,
                "dest": dest.to_string_lossy(),
                "jobs": jobs,
            }),
        )
    }

    fn create_analyzer(
        &self,
        recording: &Path,
        sorting: &Path,
        dest: &Path,
        jobs: &JobConfig,
    ) -> Result<BridgeAnalyzer, Error> {
        self.bridge.call_unit(
            "create_analyzer",
            &json!({
                "recording": recording.to_string_lossy(),
                "sorting": sorting.to_string_lossy(),
                "dest": dest.to_string_lossy(),
                "jobs": jobs,
            }),
        )?;
        Ok(BridgeAnalyzer::new(self.bridge.clone(), dest))
    }

    fn list_computable_extensions(&self, analyzer: &BridgeAnalyzer) -> Result<Vec<String>, Error> {
        self.bridge
            .call("list_extensions", &json!({ "analyzer": analyzer.dir.to_string_lossy() }))
    }

    fn compute_extension(
        &self,
        analyzer: &BridgeAnalyzer,
        name: &str,
        params: &Value,
        jobs: &JobConfig,
    ) -> Result<(), Error> {
        self.bridge.call_unit(
            "compute_extension",
            &json!({
                "analyzer": analyzer.dir.to_string_lossy(),
                "name": name,
                "params": params,
                "jobs": jobs,
            }),
        )
    }

    fn export(
        &self,
        analyzer: &BridgeAnalyzer,
        kind: ExportKind,
        dest: &Path,
        jobs: &JobConfig,
    ) -> Result<(), Error> {
        self.bridge.call_unit(
            "export",
            &json!({
                "analyzer": analyzer.dir.to_string_lossy(),
                "kind": kind,
                "dest": dest.to_string_lossy(),
                "jobs": jobs,
            }),
        )
    }

    fn load_analyzer(&self, dir: &Path) -> Result<BridgeAnalyzer, Error> {
        self.bridge
            .call_unit("load_analyzer", &json!({ "analyzer": dir.to_string_lossy() }))?;
        Ok(BridgeAnalyzer::new(self.bridge.clone(), dir))
    }
}

/// Analyzer artifact read through `analyzer` queries.
pub struct BridgeAnalyzer {
    bridge: Bridge,
    dir: PathBuf,
}

impl BridgeAnalyzer {
    fn new(bridge: Bridge, dir: &Path) -> Self {
        Self {
            bridge,
            dir: dir.to_path_buf(),
        }
    }

    fn query<T: DeserializeOwned>(&self, query: &str, args: Value) -> Result<T, Error> {
        let mut request = json!({ "analyzer": self.dir.to_string_lossy(), "query": query });
        if let (Some(target), Value::Object(extra)) = (request.as_object_mut(), args) {
            target.extend(extra);
        }
        self.bridge.call("analyzer", &request)
    }
}

impl Analyzer for BridgeAnalyzer {
    fn unit_ids(&self) -> Result<Vec<i64>, Error> {
        self.query("unit_ids", Value::Null)
    }

    fn contact_ids(&self) -> Result<Vec<u32>, Error> {
        self.query("contact_ids", Value::Null)
    }

    fn best_channels(&self, k: usize) -> Result<BTreeMap<i64, Vec<usize>>, Error> {
        self.query("best_channels", json!({ "k": k }))
    }

    fn spike_count(&self, unit_id: i64) -> Result<usize, Error> {
        self.query("spike_count", json!({ "unit_id": unit_id }))
    }

    fn spike_times(&self, unit_id: i64) -> Result<Vec<f64>, Error> {
        self.query("spike_times", json!({ "unit_id": unit_id }))
    }

    fn spike_channels(&self, unit_id: i64) -> Result<Vec<usize>, Error> {
        self.query("spike_channels", json!({ "unit_id": unit_id }))
    }

    fn spike_locations(&self, unit_id: i64) -> Result<Vec<[f64; 2]>, Error> {
        self.query("spike_locations", json!({ "unit_id": unit_id }))
    }

    fn quality_label(&self, unit_id: i64) -> Result<Option<String>, Error> {
        self.query("quality_label", json!({ "unit_id": unit_id }))
    }

    fn metrics(&self) -> Result<BTreeMap<i64, BTreeMap<String, f64>>, Error> {
        // JSON has no NaN; missing values arrive as null.
        let table: BTreeMap<i64, BTreeMap<String, Option<f64>>> =
            self.query("metrics", Value::Null)?;
        Ok(table
            .into_iter()
            .map(|(unit, row)| {
                let row = row
                    .into_iter()
                    .map(|(name, value)| (name, value.unwrap_or(f64::NAN)))
                    .collect();
                (unit, row)
            })
            .collect())
    }

    fn unit_template(&self, unit_id: i64) -> Result<Array2<f64>, Error> {
        let scratch = scratch_file()?;
        let response: MatrixResponse = self.query(
            "unit_template",
            json!({ "unit_id": unit_id, "output": scratch.path().to_string_lossy() }),
        )?;
        Ok(read_f32_matrix(scratch.path(), response.shape)?.mapv(f64::from))
    }
}
