// ABOUTME: consume command - long-running consumers for an unordered group's queue
// ABOUTME: Failed batches are recorded and left for redelivery

use anyhow::{bail, Result};
use clap::Args;
use std::sync::Arc;

use crate::context::StageContext;
use crate::hierarchy::EntityGroup;
use crate::orchestrator::{consume, ConsumeOptions, RunState};

#[derive(Args)]
pub struct ConsumeArgs {
    #[arg(long)]
    pub group: EntityGroup,
    /// Number of concurrent consumers (defaults to queue.workers)
    #[arg(long)]
    pub workers: Option<usize>,
    /// Exit once the queue is empty instead of waiting for more messages
    #[arg(long)]
    pub exit_when_empty: bool,
    /// Run date used for error records, defaults to today
    #[arg(long)]
    pub date: Option<String>,
    /// Delta count of the run being consumed, written into failure records
    #[arg(long, default_value_t = 0)]
    pub delta_count: u64,
}

pub async fn command(ctx: Arc<StageContext>, args: ConsumeArgs) -> Result<()> {
    if ctx.config.group(args.group).ordered {
        bail!(
            "{} uses an ordered queue; it is drained by the run or stage submit commands",
            args.group
        );
    }
    let options = ConsumeOptions {
        workers: args.workers.unwrap_or(ctx.config.queue.workers),
        exit_when_empty: args.exit_when_empty,
        stop_on_error: false,
        delta_count: args.delta_count,
    };
    let run_date = args.date.unwrap_or_else(RunState::today);
    let report = consume(ctx, args.group, run_date, options).await?;
    println!(
        "{} batch(es): {} sent, {} skipped, {} retried, {} failed, {} batch error(s)",
        report.batches,
        report.tally.sent,
        report.tally.skipped,
        report.tally.retried,
        report.tally.failed,
        report.errors.len()
    );
    Ok(())
}
