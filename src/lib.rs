// ABOUTME: Library root for hierarchy-sync
// ABOUTME: Delta detection, queue dispatch and run orchestration for organizational master data

pub mod commands;
pub mod config;
pub mod context;
pub mod delta;
pub mod error_sink;
pub mod errors;
pub mod extract;
pub mod hierarchy;
pub mod orchestrator;
pub mod queue;
pub mod record;
pub mod storage;
pub mod submit;
pub mod trigger;
pub mod utils;

pub use config::Config;
pub use context::StageContext;
pub use errors::{PipelineError, PipelineResult};
pub use hierarchy::EntityGroup;
pub use orchestrator::{Orchestrator, RunMode, RunState, Stage};
pub use record::Record;
