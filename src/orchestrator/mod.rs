// ABOUTME: Run orchestrator - sequences stage invocations per group and across the group graph
// ABOUTME: Stage errors are caught at one boundary and turned into a FAIL transition

pub mod consumer;
pub mod rotation;
pub mod stages;
pub mod state;

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use crate::context::StageContext;
use crate::errors::PipelineResult;
use crate::hierarchy::EntityGroup;

pub use consumer::{consume, ConsumeOptions, ConsumeReport};
pub use state::{FailureSignal, RunMode, RunState, Stage};

/// Outcome of a run across every group it reached.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub groups: Vec<RunState>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.groups.iter().all(|state| !state.is_failed())
    }

    pub fn failed(&self) -> impl Iterator<Item = &RunState> {
        self.groups.iter().filter(|state| state.is_failed())
    }

    pub fn state(&self, group: EntityGroup) -> Option<&RunState> {
        self.groups.iter().find(|state| state.entity_group == group)
    }
}

pub struct Orchestrator {
    ctx: Arc<StageContext>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    pub fn first_stage(&self, group: EntityGroup) -> Stage {
        if self.ctx.config.group(group).supports_reduction {
            Stage::Reduce
        } else {
            Stage::Detect
        }
    }

    pub async fn run_stage(&self, stage: Stage, state: &mut RunState) -> PipelineResult<()> {
        match stage {
            Stage::Reduce => stages::reduce(&self.ctx, state).await,
            Stage::Detect => stages::detect(&self.ctx, state).await,
            Stage::Dispatch => stages::dispatch(&self.ctx, state).await,
            Stage::Submit => stages::submit(&self.ctx, state).await,
            Stage::Succeed => stages::succeed(&self.ctx, state).await,
            Stage::Fail => stages::fail(&self.ctx, state).await,
        }
    }

    /// Invoke one stage. An error moves the run to FAIL carrying the cause,
    /// flagged as recorded when it is already in the error sink.
    pub async fn invoke(&self, stage: Stage, mut state: RunState) -> RunState {
        tracing::info!(
            group = %state.entity_group,
            run_date = %state.run_date,
            "Stage {} starting",
            stage
        );
        if let Err(e) = self.run_stage(stage, &mut state).await {
            if e.is_protocol_violation() {
                tracing::error!(
                    group = %state.entity_group,
                    run_date = %state.run_date,
                    "Stage {} found the queue out of step with the run, aborting: {}",
                    stage,
                    e
                );
            } else {
                tracing::error!(
                    group = %state.entity_group,
                    run_date = %state.run_date,
                    "Stage {} failed: {:?}",
                    stage,
                    e
                );
            }
            let recorded = e.is_recorded();
            state.error = match state.error.take() {
                // a failing FAIL keeps the original cause
                Some(previous) if stage == Stage::Fail => Some(previous),
                _ => Some(FailureSignal {
                    cause: e.to_string(),
                    recorded,
                }),
            };
            state.next_stage = if stage == Stage::Fail {
                None
            } else {
                Some(Stage::Fail)
            };
        }
        state
    }

    /// Drive one group through its stages until a terminal stage has run.
    pub async fn run_group(&self, group: EntityGroup, run_date: &str, mode: RunMode) -> RunState {
        let mut state = RunState::new(group, run_date, mode);
        let mut stage = self.first_stage(group);
        loop {
            state = if stage == Stage::Submit && !self.ctx.config.group(group).ordered {
                self.consume_all(state).await
            } else {
                self.invoke(stage, state).await
            };
            if stage.is_terminal() {
                break;
            }
            match state.next_stage {
                Some(next) => stage = next,
                None => break,
            }
        }
        state
    }

    /// SUBMIT for an unordered group: concurrent consumers until the queue
    /// is empty. Consumers record their own failures.
    async fn consume_all(&self, mut state: RunState) -> RunState {
        let options = ConsumeOptions {
            workers: self.ctx.config.queue.workers,
            exit_when_empty: true,
            stop_on_error: true,
            delta_count: state.delta_count,
        };
        let result = consume(
            self.ctx.clone(),
            state.entity_group,
            state.run_date.clone(),
            options,
        )
        .await;
        match result {
            Ok(report) => {
                report.tally.apply(&mut state);
                if report.errors.is_empty() {
                    state.queue_length = Some(0);
                    state.next_stage = Some(Stage::Succeed);
                } else {
                    state.error = Some(FailureSignal {
                        cause: report.errors.join("; "),
                        recorded: true,
                    });
                    state.next_stage = Some(Stage::Fail);
                }
            }
            Err(e) => {
                tracing::error!("Consumers for {} failed: {:?}", state.entity_group, e);
                state.error = Some(FailureSignal {
                    cause: e.to_string(),
                    recorded: false,
                });
                state.next_stage = Some(Stage::Fail);
            }
        }
        state
    }

    /// Run a group and every group its successes trigger, breadth first.
    pub async fn run(&self, group: EntityGroup, run_date: &str, mode: RunMode) -> RunReport {
        let mut report = RunReport::default();
        let mut pending = VecDeque::from([group]);
        let mut seen = BTreeSet::from([group]);

        while let Some(group) = pending.pop_front() {
            let state = self.run_group(group, run_date, mode).await;
            if state.is_failed() {
                tracing::error!(
                    "{} failed, not starting its downstream groups",
                    group
                );
            }
            for &next in &state.triggered {
                if seen.insert(next) {
                    pending.push_back(next);
                }
            }
            report.groups.push(state);
        }
        report
    }
}
