// ABOUTME: queue command - inspect or purge a group's work queue
// ABOUTME: Lengths are read after the configured settle delay

use anyhow::Result;
use clap::{Args, Subcommand};
use std::sync::Arc;

use crate::context::StageContext;
use crate::hierarchy::EntityGroup;
use crate::queue::LengthMode;

#[derive(Args)]
pub struct QueueArgs {
    #[command(subcommand)]
    command: QueueCommands,
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Show the number of messages in a group's queue
    Length {
        #[arg(long)]
        group: EntityGroup,
        #[arg(long, value_enum, default_value_t = LengthMode::Total)]
        mode: LengthMode,
    },
    /// Remove every message from a group's queue
    Purge {
        #[arg(long)]
        group: EntityGroup,
    },
}

pub async fn command(ctx: Arc<StageContext>, args: QueueArgs) -> Result<()> {
    match args.command {
        QueueCommands::Length { group, mode } => {
            let queue = ctx.queue(group)?;
            let length = queue.length(mode).await?;
            println!("{} {}: {}", queue.label(), mode, length);
        }
        QueueCommands::Purge { group } => {
            let queue = ctx.queue(group)?;
            queue.purge().await?;
            println!("{} purged.", queue.label());
        }
    }
    Ok(())
}
