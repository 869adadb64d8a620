use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_DATABASE_PATH: &str = "ephys_pipeline.db";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Root directories holding raw acquisition data.
    pub ephys_root_dirs: Vec<String>,
    /// Root for processed outputs. Defaults to the first raw root.
    #[serde(default)]
    pub processed_root_dir: Option<String>,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default)]
    pub jobs: JobConfig,
    #[serde(default)]
    pub bridge: Option<BridgeConfig>,
}

/// The two knobs handed to every heavy numeric collaborator.
#[derive(Debug, Clone, Copy, Deserialize, serde::Serialize, PartialEq, Eq)]
pub struct JobConfig {
    /// Worker count; zero or negative means "all available cores".
    #[serde(default = "default_n_jobs")]
    pub n_jobs: i32,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            n_jobs: default_n_jobs(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl JobConfig {
    pub fn worker_count(&self) -> usize {
        if self.n_jobs > 0 {
            self.n_jobs as usize
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

/// External process speaking the JSON-over-stdio bridge protocol.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

fn default_database_path() -> String {
    DEFAULT_DATABASE_PATH.to_string()
}

fn default_n_jobs() -> i32 {
    -1
}

fn default_chunk_size() -> usize {
    30_000
}

pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Config").required(false))
        .add_source(
            Environment::with_prefix("EPHYS")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("ephys_root_dirs")
                .with_list_parse_key("ignore_patterns")
                .try_parsing(true),
        )
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

/// Remove directories that are subdirectories of other directories in the list.
pub fn non_overlapping_directories(dirs: Vec<String>) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();

    for dir in dirs {
        let dir_path = Path::new(&dir);
        let mut should_add = true;
        let result_clone = result.clone();

        for res_dir in &result_clone {
            let res_dir_path = Path::new(res_dir);

            if dir_path.starts_with(res_dir_path) {
                should_add = false;
                break;
            }

            if res_dir_path.starts_with(dir_path) {
                result.retain(|x| x != res_dir);
                break;
            }
        }

        if should_add {
            result.push(dir);
        }
    }

    result
}
