pub mod catalog;
pub mod config;
pub mod digest;
pub mod engine;
pub mod error;
pub mod lfp;
pub mod locator;
pub mod probe;
pub mod progress;
pub mod reader;
pub mod sorting;
pub mod storage;

pub use config::{AppConfig, JobConfig};
pub use engine::{EphysEngine, PendingWork, SortingRunResult};
pub use error::{Error, Outcome, PassSummary};
pub use locator::{ConfiguredLocator, DataLocator};
pub use progress::{PipelineReporter, SilentReporter};
pub use reader::{RawHeader, RawReader, RawRecording};
