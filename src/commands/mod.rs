// ABOUTME: Command implementations behind the CLI
// ABOUTME: Exports ingest, run, stage, consume and queue commands

pub mod consume;
pub mod ingest;
pub mod queue;
pub mod run;
pub mod stage;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::context::StageContext;

pub use consume::ConsumeArgs;
pub use ingest::IngestArgs;
pub use queue::QueueArgs;
pub use run::RunArgs;
pub use stage::StageArgs;

/// Load the config file, or the built-in configuration when none is given.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            tracing::info!("Loading configuration from {:?}", path);
            Config::load(path)
        }
        None => Ok(Config::default()),
    }
}

pub fn open_context(config: Config) -> Result<Arc<StageContext>> {
    tracing::debug!("Storage root: {:?}", config.storage.root);
    Ok(Arc::new(StageContext::open(config)?))
}
