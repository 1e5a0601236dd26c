// ABOUTME: run command - drives a group and its downstream groups through every stage
// ABOUTME: Exits with an error when any group of the run failed

use anyhow::{bail, Result};
use clap::Args;
use std::sync::Arc;

use crate::context::StageContext;
use crate::hierarchy::EntityGroup;
use crate::orchestrator::{Orchestrator, RunMode, RunReport, RunState};

#[derive(Args)]
pub struct RunArgs {
    /// Entity group to start from
    #[arg(long)]
    pub group: EntityGroup,
    /// Run date (YYYY-MM-DD), defaults to today
    #[arg(long)]
    pub date: Option<String>,
    /// Run mode; debug and manual back up snapshots without rotating
    #[arg(long, value_enum, default_value_t = RunMode::Continue)]
    pub mode: RunMode,
}

pub async fn command(ctx: Arc<StageContext>, args: RunArgs) -> Result<()> {
    let run_date = args.date.unwrap_or_else(RunState::today);
    let report = Orchestrator::new(ctx)
        .run(args.group, &run_date, args.mode)
        .await;
    print_report(&report);
    if !report.is_success() {
        let failed: Vec<String> = report
            .failed()
            .map(|state| state.entity_group.to_string())
            .collect();
        bail!("Run {} failed for: {}", run_date, failed.join(", "));
    }
    Ok(())
}

pub fn print_report(report: &RunReport) {
    for state in &report.groups {
        match &state.error {
            None => println!(
                "✓ {}: {} delta(s), {} sent, {} skipped, {} failed",
                state.entity_group,
                state.delta_count,
                state.sent_count,
                state.skipped_count,
                state.failed_count
            ),
            Some(signal) => println!("✗ {}: {}", state.entity_group, signal.cause),
        }
        if !state.withheld.is_empty() {
            println!("  held back for the next run: {}", state.withheld.join(", "));
        }
    }
}
