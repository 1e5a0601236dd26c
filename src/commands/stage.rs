// ABOUTME: stage command - one stateless stage invocation over a JSON run state
// ABOUTME: Reads the state from a file or stdin and prints the updated state

use anyhow::{bail, Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::context::StageContext;
use crate::orchestrator::{Orchestrator, RunState, Stage};

#[derive(Args)]
pub struct StageArgs {
    /// Stage to invoke
    #[arg(value_enum)]
    pub stage: Stage,
    /// Run state JSON file; read from stdin when omitted
    #[arg(long)]
    pub state: Option<PathBuf>,
}

async fn read_state(path: Option<&PathBuf>) -> Result<RunState> {
    let text = match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read run state {:?}", path))?,
        None => {
            let mut text = String::new();
            tokio::io::stdin()
                .read_to_string(&mut text)
                .await
                .context("Failed to read run state from stdin")?;
            text
        }
    };
    serde_json::from_str(&text).context("Invalid run state JSON")
}

pub async fn command(ctx: Arc<StageContext>, args: StageArgs) -> Result<()> {
    let state = read_state(args.state.as_ref()).await?;
    let state = Orchestrator::new(ctx).invoke(args.stage, state).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&state).context("Failed to serialize run state")?
    );
    if args.stage == Stage::Fail {
        if let Some(signal) = &state.error {
            bail!("Run of {} failed: {}", state.entity_group, signal.cause);
        }
    }
    Ok(())
}
