// ABOUTME: ingest command - writes an extract into a group's new snapshot slot
// ABOUTME: The written key goes through the trigger table to start the dependent run

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;

use super::run::print_report;
use crate::context::StageContext;
use crate::extract::{Extractor, JsonLinesExtractor};
use crate::hierarchy::EntityGroup;
use crate::orchestrator::Orchestrator;
use crate::storage::snapshot::slot_key;
use crate::storage::Slot;
use crate::trigger;

#[derive(Args)]
pub struct IngestArgs {
    /// Entity group the extract belongs to
    #[arg(long)]
    pub group: EntityGroup,
    /// JSON-lines file with one record per line
    #[arg(long)]
    pub file: PathBuf,
    /// Snapshot key name used for trigger routing (defaults to the slot key)
    #[arg(long)]
    pub key_name: Option<String>,
    /// Only write the snapshot, do not start a run
    #[arg(long)]
    pub no_run: bool,
}

pub async fn command(ctx: Arc<StageContext>, args: IngestArgs) -> Result<()> {
    // An explicit key must route; a group's own slot key may start nothing.
    let (key, start) = match args.key_name {
        Some(key) => {
            let start = trigger::route(&key)?;
            (key, start)
        }
        None => {
            let key = slot_key(args.group, Slot::New);
            let start = match trigger::route(&key) {
                Ok(start) => start,
                Err(e) => {
                    tracing::info!("{} snapshots start no run: {}", args.group, e);
                    None
                }
            };
            (key, start)
        }
    };

    let records = JsonLinesExtractor::new(&args.file)
        .extract(args.group)
        .await?;
    ctx.snapshots
        .write(args.group, Slot::New, &records)
        .await?;
    println!("✓ Wrote {} {} record(s)", records.len(), args.group);

    let Some(start) = start else {
        return Ok(());
    };
    if args.no_run {
        println!("Snapshot {} would start {}", key, start);
        return Ok(());
    }

    let state = trigger::start_state(start);
    let report = Orchestrator::new(ctx)
        .run(start, &state.run_date, state.mode)
        .await;
    print_report(&report);
    if !report.is_success() {
        anyhow::bail!("Run started by {} failed", key);
    }
    Ok(())
}
