// ABOUTME: Stage handlers - REDUCE, DETECT, DISPATCH, SUBMIT, SUCCEED and FAIL
// ABOUTME: Each takes the run state, does one unit of work and names the next stage

use anyhow::anyhow;

use super::rotation;
use super::state::{FailureSignal, RunState, Stage};
use crate::config::GroupConfig;
use crate::context::StageContext;
use crate::error_sink::RunFailure;
use crate::errors::{PipelineError, PipelineResult};
use crate::hierarchy::EntityGroup;
use crate::queue::{LengthMode, QueueMessage, WorkQueue};
use crate::storage::Slot;
use crate::submit::{SubmitOutcome, Submitter};

/// Per-batch submission counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchTally {
    pub sent: u64,
    pub skipped: u64,
    /// Failures that used up their deliveries.
    pub failed: u64,
    /// Failures released for another delivery.
    pub retried: u64,
    pub withheld: Vec<String>,
}

impl BatchTally {
    pub fn add(&mut self, other: BatchTally) {
        self.sent += other.sent;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.retried += other.retried;
        self.withheld.extend(other.withheld);
    }

    pub fn apply(&self, state: &mut RunState) {
        state.sent_count += self.sent;
        state.skipped_count += self.skipped;
        state.failed_count += self.failed;
        state.withheld.extend(self.withheld.iter().cloned());
    }
}

fn current_slot(policy: &GroupConfig) -> Slot {
    if policy.supports_reduction {
        Slot::Reduced
    } else {
        Slot::New
    }
}

/// Filter the `new` snapshot through the reduction query into `reduced`.
pub async fn reduce(ctx: &StageContext, state: &mut RunState) -> PipelineResult<()> {
    let group = state.entity_group;
    let policy = ctx.config.group(group);
    state.next_stage = Some(Stage::Detect);

    let query = match (&policy.reduction_query, policy.supports_reduction) {
        (Some(query), true) => query,
        _ => {
            tracing::info!("{} does not support reduction, skipping", group);
            return Ok(());
        }
    };

    let total = ctx
        .snapshots
        .read(group, Slot::New)
        .await?
        .map(|records| records.len() as u64)
        .unwrap_or(0);
    let detection = ctx
        .detector
        .detect_within(
            ctx.config.detector.deadline(),
            &ctx.snapshots,
            group,
            Slot::New,
            query,
        )
        .await?;
    ctx.snapshots
        .write(group, Slot::Reduced, &detection.records)
        .await?;
    state.reduced_count = total.saturating_sub(detection.records.len() as u64);
    tracing::info!(
        "Reduced {}: kept {} of {} record(s)",
        group,
        detection.records.len(),
        total
    );
    Ok(())
}

/// Purge the group's queue and compute the deltas.
pub async fn detect(ctx: &StageContext, state: &mut RunState) -> PipelineResult<()> {
    let group = state.entity_group;
    let policy = ctx.config.group(group);

    let queue = ctx.queue(group)?;
    queue.purge().await?;

    let detection = ctx
        .detector
        .detect_within(
            ctx.config.detector.deadline(),
            &ctx.snapshots,
            group,
            current_slot(&policy),
            &policy.delta_query,
        )
        .await?;

    state.delta_count = detection.records.len() as u64;
    state.query_id = Some(detection.query_id);
    state.queue_length = None;
    state.next_stage = Some(Stage::Dispatch);
    tracing::info!("{} has {} delta(s)", group, state.delta_count);
    Ok(())
}

/// Load the detected deltas into the queue and verify nothing was lost.
pub async fn dispatch(ctx: &StageContext, state: &mut RunState) -> PipelineResult<()> {
    let group = state.entity_group;
    if state.delta_count == 0 {
        tracing::info!("No deltas for {}, nothing to dispatch", group);
        state.queue_length = Some(0);
        state.next_stage = Some(Stage::Succeed);
        return Ok(());
    }

    let query_id = state
        .query_id
        .clone()
        .ok_or_else(|| anyhow!("{} has {} delta(s) but no query id", group, state.delta_count))?;
    let records = ctx.detector.fetch(&query_id).await?;
    if records.len() as u64 != state.delta_count {
        return Err(PipelineError::CountMismatch {
            what: "delta count",
            expected: state.delta_count,
            found: records.len() as u64,
        });
    }

    let queue = ctx.queue(group)?;
    let sent = queue.enqueue_batch(&records, &query_id).await? as u64;
    if sent != state.delta_count {
        return Err(PipelineError::CountMismatch {
            what: "sent count",
            expected: state.delta_count,
            found: sent,
        });
    }

    if queue.is_ordered() {
        let length = queue.length(LengthMode::Total).await?;
        state.queue_length = Some(length);
        if length != state.delta_count {
            tracing::error!(
                "{}: queue holds {} message(s) after sending {}",
                queue.label(),
                length,
                sent
            );
            return Err(PipelineError::CountMismatch {
                what: "queue length",
                expected: state.delta_count,
                found: length,
            });
        }
    }

    state.next_stage = Some(Stage::Submit);
    Ok(())
}

/// Submit every message of a batch and acknowledge what is done.
///
/// Only successes and skips are acknowledged. Failures are already in the
/// error sink when the submitter reports them. Under a halting policy the
/// first failure stops the batch: messages done so far are acknowledged, the
/// failed one stays in flight. Otherwise a failed message is released for
/// another delivery until it has been received `max_receive_count` times;
/// after that it is removed and its id withheld from rotation.
///
/// An `Err` from the submitter acknowledges the finished prefix of an ordered
/// batch; an unordered batch is left entirely for redelivery.
pub async fn process_batch(
    queue: &WorkQueue,
    submitter: &Submitter,
    group: EntityGroup,
    run_date: &str,
    policy: &GroupConfig,
    batch: &[QueueMessage],
) -> PipelineResult<BatchTally> {
    let ordered = queue.is_ordered();
    let max_receives = queue.max_receive_count();
    let mut tally = BatchTally::default();
    let mut done: Vec<QueueMessage> = Vec::with_capacity(batch.len());
    let mut retry: Vec<QueueMessage> = Vec::new();

    for message in batch {
        let outcome = match submitter.submit(group, run_date, message).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if ordered {
                    queue.ack_batch(&done).await?;
                    queue.release(&retry).await?;
                }
                return Err(e);
            }
        };
        match &outcome {
            SubmitOutcome::Success => tally.sent += 1,
            SubmitOutcome::Skipped(_) => tally.skipped += 1,
            _ => {}
        }
        if outcome.is_done() {
            done.push(message.clone());
            continue;
        }

        let cause = outcome.reason().unwrap_or("unknown failure").to_string();
        if policy.halt_on_failure {
            queue.ack_batch(&done).await?;
            return Err(PipelineError::Halted {
                group: group.to_string(),
                cause,
            });
        }
        if message.receive_count < max_receives {
            tracing::warn!(
                "{}: {} failed on delivery {} of {}, releasing it: {}",
                group,
                message.record.id,
                message.receive_count,
                max_receives,
                cause
            );
            tally.retried += 1;
            retry.push(message.clone());
        } else {
            tracing::error!(
                "{}: {} failed on all {} deliveries, withholding it from rotation: {}",
                group,
                message.record.id,
                max_receives,
                cause
            );
            tally.failed += 1;
            tally.withheld.push(message.record.id.clone());
            done.push(message.clone());
        }
    }

    queue.ack_batch(&done).await?;
    queue.release(&retry).await?;
    Ok(tally)
}

/// Drain one batch from the queue and submit it.
pub async fn submit(ctx: &StageContext, state: &mut RunState) -> PipelineResult<()> {
    let group = state.entity_group;
    let policy = ctx.config.group(group);
    let queue = ctx.queue(group)?;
    let submitter = ctx.submitter().await?;

    let batch = if queue.is_ordered() {
        queue.drain_batch().await?
    } else {
        queue.poll_batch().await?
    };
    let tally = process_batch(&queue, &submitter, group, &state.run_date, &policy, &batch).await?;
    tally.apply(state);
    tracing::info!(
        "{}: batch of {} done ({} sent, {} skipped, {} retried, {} failed)",
        group,
        batch.len(),
        tally.sent,
        tally.skipped,
        tally.retried,
        tally.failed
    );

    let remaining = queue.length(LengthMode::Total).await?;
    state.queue_length = Some(remaining);
    state.next_stage = Some(if remaining > 0 {
        Stage::Submit
    } else {
        Stage::Succeed
    });
    Ok(())
}

/// Rotate snapshots and trigger the next groups. Outside continue mode the
/// slots are only backed up.
pub async fn succeed(ctx: &StageContext, state: &mut RunState) -> PipelineResult<()> {
    let group = state.entity_group;
    let policy = ctx.config.group(group);
    state.next_stage = None;

    if !state.mode.rotates() {
        rotation::backup_all(&ctx.snapshots, &state.run_date, group, &policy).await?;
        tracing::info!(
            "{:?} mode: {} backed up, snapshots and queue left as they are",
            state.mode,
            group
        );
        return Ok(());
    }

    rotation::rotate(
        &ctx.snapshots,
        &state.run_date,
        group,
        &policy,
        &state.withheld,
    )
    .await?;
    state.triggered = policy.next.clone();
    tracing::info!(
        "{} succeeded ({} sent, {} skipped, {} failed)",
        group,
        state.sent_count,
        state.skipped_count,
        state.failed_count
    );
    Ok(())
}

/// Record the run failure unless it is already in the error sink.
pub async fn fail(ctx: &StageContext, state: &mut RunState) -> PipelineResult<()> {
    state.next_stage = None;
    let Some(signal) = state.error.clone() else {
        tracing::warn!("FAIL invoked for {} without a failure", state.entity_group);
        return Ok(());
    };
    if signal.recorded {
        tracing::info!(
            "Failure of {} already recorded: {}",
            state.entity_group,
            signal.cause
        );
        return Ok(());
    }

    ctx.errors
        .record_run(&RunFailure {
            group: state.entity_group,
            run_date: &state.run_date,
            delta_count: state.delta_count,
            queue_length: state.queue_length,
            cause: &signal.cause,
        })
        .await?;
    state.error = Some(FailureSignal {
        recorded: true,
        ..signal
    });
    Ok(())
}
