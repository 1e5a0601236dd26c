// ABOUTME: Unordered queue consumers - concurrent workers draining a standard queue
// ABOUTME: A failed batch is left unacknowledged and comes back after the visibility timeout

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use super::stages::{process_batch, BatchTally};
use crate::context::StageContext;
use crate::error_sink::RunFailure;
use crate::hierarchy::EntityGroup;
use crate::queue::LengthMode;

const MIN_IDLE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
pub struct ConsumeOptions {
    pub workers: usize,
    /// Stop once the queue holds nothing, in flight included.
    pub exit_when_empty: bool,
    /// Stop every worker after the first failed batch. Queue protocol
    /// violations always stop them.
    pub stop_on_error: bool,
    /// Delta count of the run being consumed, carried into failure records.
    pub delta_count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ConsumeReport {
    pub tally: BatchTally,
    pub batches: u64,
    pub errors: Vec<String>,
}

impl ConsumeReport {
    fn merge(&mut self, other: ConsumeReport) {
        self.tally.add(other.tally);
        self.batches += other.batches;
        self.errors.extend(other.errors);
    }
}

/// Run consumers against a group's queue until they stop.
pub async fn consume(
    ctx: Arc<StageContext>,
    group: EntityGroup,
    run_date: String,
    options: ConsumeOptions,
) -> Result<ConsumeReport> {
    let workers = options.workers.max(1);
    let stop = Arc::new(AtomicBool::new(false));
    let mut set = JoinSet::new();
    tracing::info!("Starting {} consumer(s) for {}", workers, group);

    for worker_id in 0..workers {
        let ctx = ctx.clone();
        let run_date = run_date.clone();
        let stop = stop.clone();
        set.spawn(async move { worker(worker_id, ctx, group, run_date, options, stop).await });
    }

    let mut report = ConsumeReport::default();
    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        match joined.context("Consumer task panicked")? {
            Ok(worker_report) => report.merge(worker_report),
            Err(e) => {
                stop.store(true, Ordering::SeqCst);
                tracing::error!("Consumer for {} stopped: {:?}", group, e);
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    tracing::info!(
        "Consumers for {} finished: {} batch(es), {} sent, {} retried, {} failed, {} error(s)",
        group,
        report.batches,
        report.tally.sent,
        report.tally.retried,
        report.tally.failed,
        report.errors.len()
    );
    Ok(report)
}

async fn worker(
    worker_id: usize,
    ctx: Arc<StageContext>,
    group: EntityGroup,
    run_date: String,
    options: ConsumeOptions,
    stop: Arc<AtomicBool>,
) -> Result<ConsumeReport> {
    let queue = ctx.queue(group)?;
    let submitter = ctx.submitter().await?;
    let policy = ctx.config.group(group);
    let idle = ctx.config.queue.settle_delay().max(MIN_IDLE);
    let mut report = ConsumeReport::default();

    while !stop.load(Ordering::SeqCst) {
        let batch = queue.poll_batch().await?;
        if batch.is_empty() {
            if options.exit_when_empty && queue.length(LengthMode::Total).await? == 0 {
                break;
            }
            tokio::time::sleep(idle).await;
            continue;
        }

        report.batches += 1;
        match process_batch(&queue, &submitter, group, &run_date, &policy, &batch).await {
            Ok(tally) => report.tally.add(tally),
            Err(e) => {
                tracing::error!(
                    "Consumer {} of {}: batch of {} failed: {:?}",
                    worker_id,
                    group,
                    batch.len(),
                    e
                );
                let cause = e.to_string();
                if !e.is_recorded() {
                    let queue_length = match queue.length(LengthMode::Total).await {
                        Ok(length) => Some(length),
                        Err(length_err) => {
                            tracing::warn!(
                                "Could not read {} length for the failure record: {}",
                                queue.label(),
                                length_err
                            );
                            None
                        }
                    };
                    ctx.errors
                        .record_run(&RunFailure {
                            group,
                            run_date: &run_date,
                            delta_count: options.delta_count,
                            queue_length,
                            cause: &cause,
                        })
                        .await?;
                }
                report.errors.push(cause);
                if options.stop_on_error || e.is_protocol_violation() {
                    stop.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }
    }
    Ok(report)
}
