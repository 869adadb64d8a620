use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// One phase of the spike-sorting pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    PreProcessing,
    Sorting,
    PostProcessing,
    Export,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::PreProcessing,
        Stage::Sorting,
        Stage::PostProcessing,
        Stage::Export,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::PreProcessing => "preprocessing",
            Stage::Sorting => "sorting",
            Stage::PostProcessing => "postprocessing",
            Stage::Export => "export",
        }
    }

    /// 1-based position; stored alongside results so "this stage or later" is a range query.
    pub fn ordinal(&self) -> i64 {
        match self {
            Stage::PreProcessing => 1,
            Stage::Sorting => 2,
            Stage::PostProcessing => 3,
            Stage::Export => 4,
        }
    }

    pub fn upstream(&self) -> Option<Stage> {
        match self {
            Stage::PreProcessing => None,
            Stage::Sorting => Some(Stage::PreProcessing),
            Stage::PostProcessing => Some(Stage::Sorting),
            Stage::Export => Some(Stage::PostProcessing),
        }
    }

    /// State a task reaches once this stage completes.
    pub fn completes_to(&self) -> TaskState {
        match self {
            Stage::PreProcessing => TaskState::PreProcessed,
            Stage::Sorting => TaskState::Sorted,
            Stage::PostProcessing => TaskState::PostProcessed,
            Stage::Export => TaskState::Exported,
        }
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown pipeline stage '{}'", s)))
    }
}

/// Lifecycle of a clustering task. Transitions only move forward, one stage at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskState {
    Pending,
    PreProcessed,
    Sorted,
    PostProcessed,
    Exported,
}

impl TaskState {
    /// Derive the state from the set of completed stages, rejecting gaps.
    pub fn from_completed(completed: &[Stage]) -> Result<Self, Error> {
        let mut state = TaskState::Pending;
        let mut sorted = completed.to_vec();
        sorted.sort();
        sorted.dedup();
        for stage in sorted {
            state = state.advance(stage)?;
        }
        Ok(state)
    }

    /// The stage that would move this task forward, if any.
    pub fn next_stage(&self) -> Option<Stage> {
        match self {
            TaskState::Pending => Some(Stage::PreProcessing),
            TaskState::PreProcessed => Some(Stage::Sorting),
            TaskState::Sorted => Some(Stage::PostProcessing),
            TaskState::PostProcessed => Some(Stage::Export),
            TaskState::Exported => None,
        }
    }

    pub fn advance(self, stage: Stage) -> Result<Self, Error> {
        if self.next_stage() == Some(stage) {
            Ok(stage.completes_to())
        } else {
            Err(Error::Consistency(format!(
                "cannot complete {} from state {:?}",
                stage.as_str(),
                self
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_advances_in_order() {
        let state = TaskState::Pending
            .advance(Stage::PreProcessing)
            .and_then(|s| s.advance(Stage::Sorting))
            .and_then(|s| s.advance(Stage::PostProcessing))
            .unwrap();
        assert_eq!(state, TaskState::PostProcessed);
        assert_eq!(state.next_stage(), Some(Stage::Export));
    }

    #[test]
    fn test_state_rejects_skips_and_backward_moves() {
        assert!(TaskState::Pending.advance(Stage::Sorting).is_err());
        assert!(TaskState::Sorted.advance(Stage::PreProcessing).is_err());
        assert!(TaskState::Exported.advance(Stage::Export).is_err());
    }

    #[test]
    fn test_from_completed_detects_gaps() {
        assert_eq!(
            TaskState::from_completed(&[Stage::Sorting, Stage::PreProcessing]).unwrap(),
            TaskState::Sorted
        );
        assert!(TaskState::from_completed(&[Stage::PreProcessing, Stage::PostProcessing]).is_err());
        assert_eq!(TaskState::from_completed(&[]).unwrap(), TaskState::Pending);
    }

    #[test]
    fn test_stage_names_parse() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("curation".parse::<Stage>().is_err());
    }
}
