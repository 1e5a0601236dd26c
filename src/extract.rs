// ABOUTME: Extraction collaborator - produces the flat records of a group
// ABOUTME: JSON-lines files are the built-in source

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;

use crate::hierarchy::EntityGroup;
use crate::record::{parse_json_lines, Record};

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, group: EntityGroup) -> Result<Vec<Record>>;
}

/// Reads one JSON object per line.
pub struct JsonLinesExtractor {
    path: PathBuf,
}

impl JsonLinesExtractor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Extractor for JsonLinesExtractor {
    async fn extract(&self, group: EntityGroup) -> Result<Vec<Record>> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {} extract {:?}", group, self.path))?;
        let records = parse_json_lines(&text)
            .with_context(|| format!("Invalid {} extract {:?}", group, self.path))?;
        tracing::info!("Extracted {} {} record(s)", records.len(), group);
        Ok(records)
    }
}
