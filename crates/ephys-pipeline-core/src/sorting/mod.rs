//! Spike sorting: parameter sets, the staged orchestrator, artifact memoization and the
//! unit aggregator.

pub mod aggregate;
pub mod collab;
pub mod memo;
pub mod orchestrator;
pub mod params;
pub mod stage;

pub use aggregate::Aggregator;
pub use collab::{Analyzer, RecordingChannel, RecordingRequest, SortingEngine};
pub use memo::{lookup_or_compute, MemoStatus};
pub use orchestrator::{ArtifactLayout, Orchestrator};
pub use params::{insert_parameter_set, PreprocessingMethod, SorterId};
pub use stage::{Stage, TaskState};
