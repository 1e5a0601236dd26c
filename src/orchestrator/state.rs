// ABOUTME: RunState - the structured payload threaded between stage invocations
// ABOUTME: Serialized as JSON at the stage boundary, mutated by each stage's result

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hierarchy::EntityGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Rotate snapshots and trigger the next groups on success.
    #[default]
    Continue,
    /// Stop after backing up; nothing is rotated.
    Debug,
    Manual,
}

impl RunMode {
    pub fn rotates(&self) -> bool {
        matches!(self, RunMode::Continue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Reduce,
    Detect,
    Dispatch,
    Submit,
    Succeed,
    Fail,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Reduce => "reduce",
            Stage::Detect => "detect",
            Stage::Dispatch => "dispatch",
            Stage::Submit => "submit",
            Stage::Succeed => "succeed",
            Stage::Fail => "fail",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Succeed | Stage::Fail)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure carried into the FAIL stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSignal {
    pub cause: String,
    /// The cause is already in the error sink.
    #[serde(default)]
    pub recorded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub entity_group: EntityGroup,
    pub run_date: String,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub delta_count: u64,
    #[serde(default)]
    pub queue_length: Option<u64>,
    #[serde(default)]
    pub reduced_count: u64,
    #[serde(default)]
    pub sent_count: u64,
    #[serde(default)]
    pub failed_count: u64,
    #[serde(default)]
    pub skipped_count: u64,
    /// Ids of records that failed on every delivery. Rotation keeps their
    /// previous version so the next run detects them again.
    #[serde(default)]
    pub withheld: Vec<String>,
    #[serde(default)]
    pub query_id: Option<String>,
    /// Stage to invoke next. `None` once a terminal stage has run.
    #[serde(default)]
    pub next_stage: Option<Stage>,
    /// Groups started by a successful rotation.
    #[serde(default)]
    pub triggered: Vec<EntityGroup>,
    #[serde(default)]
    pub error: Option<FailureSignal>,
}

impl RunState {
    pub fn new(entity_group: EntityGroup, run_date: impl Into<String>, mode: RunMode) -> Self {
        Self {
            entity_group,
            run_date: run_date.into(),
            mode,
            delta_count: 0,
            queue_length: None,
            reduced_count: 0,
            sent_count: 0,
            failed_count: 0,
            skipped_count: 0,
            withheld: Vec::new(),
            query_id: None,
            next_stage: None,
            triggered: Vec::new(),
            error: None,
        }
    }

    /// Today's date in the format used for run dates.
    pub fn today() -> String {
        chrono::Local::now().format("%Y-%m-%d").to_string()
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_fills_defaults() {
        let state: RunState =
            serde_json::from_str(r#"{"entity_group": "site", "run_date": "2024-05-01"}"#).unwrap();
        assert_eq!(state.mode, RunMode::Continue);
        assert_eq!(state.queue_length, None);
        assert!(state.next_stage.is_none());
        assert!(!state.is_failed());
    }

    #[test]
    fn stage_and_mode_serialize_lowercase() {
        let mut state = RunState::new(EntityGroup::Company, "2024-05-01", RunMode::Debug);
        state.next_stage = Some(Stage::Dispatch);
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["mode"], "debug");
        assert_eq!(value["next_stage"], "dispatch");
        assert_eq!(value["entity_group"], "company");
        assert!(!state.mode.rotates());
    }
}
