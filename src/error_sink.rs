// ABOUTME: Error sink - write-once failure records keyed by run date, group and item
// ABOUTME: Existing entries are never rewritten, so re-raised failures are not logged twice

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::hierarchy::EntityGroup;
use crate::storage::{BlobStore, StorageError};

/// Context of a run-level failure.
#[derive(Debug, Clone)]
pub struct RunFailure<'a> {
    pub group: EntityGroup,
    pub run_date: &'a str,
    pub delta_count: u64,
    pub queue_length: Option<u64>,
    pub cause: &'a str,
}

fn key_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if matches!(c, '/' | '\\') || c.is_control() { '_' } else { c })
        .collect()
}

pub fn item_key(run_date: &str, group: EntityGroup, item: &str) -> String {
    format!(
        "{date}/{group}/{date}_{group}_{item}.txt",
        date = run_date,
        group = group.as_str(),
        item = key_safe(item)
    )
}

/// Run failure key. The digest of the cause makes the same failure map to the
/// same key.
pub fn run_key(run_date: &str, group: EntityGroup, cause: &str) -> String {
    let digest = Sha256::digest(cause.as_bytes());
    let short: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!(
        "{date}/{group}/{date}_{group}_error_{short}.txt",
        date = run_date,
        group = group.as_str(),
    )
}

#[derive(Clone)]
pub struct ErrorSink {
    blobs: Arc<dyn BlobStore>,
    bucket: String,
}

impl ErrorSink {
    pub fn new(blobs: Arc<dyn BlobStore>, bucket: impl Into<String>) -> Self {
        Self {
            blobs,
            bucket: bucket.into(),
        }
    }

    /// Record a per-item failure. Returns `false` when an entry for the item
    /// already exists.
    pub async fn record_item(
        &self,
        run_date: &str,
        group: EntityGroup,
        item: &str,
        fault: &str,
        data: &serde_json::Value,
    ) -> Result<bool> {
        let key = item_key(run_date, group, item);
        let mut body = format!("ID:\n{}\n\nGroup:\n{}\nRun date: {}\n\nResponse:\n", item, group, run_date);
        for line in fault.lines() {
            body.push_str(line);
            body.push('\n');
        }
        body.push_str("\nData from queue:\n");
        body.push_str(&serde_json::to_string_pretty(data).context("Failed to format item data")?);
        body.push('\n');
        self.write_once(&key, &body).await
    }

    /// Record a run-level failure. Returns `false` when the same cause was
    /// already recorded for this group and date.
    pub async fn record_run(&self, failure: &RunFailure<'_>) -> Result<bool> {
        let key = run_key(failure.run_date, failure.group, failure.cause);
        let queue_length = failure
            .queue_length
            .map(|n| n.to_string())
            .unwrap_or_else(|| "none".to_string());
        let body = format!(
            "Group:\n{}\n\nDeltas:\n{}\n\nQueue length:\n{}\n\nError:\n{}\n",
            failure.group, failure.delta_count, queue_length, failure.cause
        );
        self.write_once(&key, &body).await
    }

    async fn write_once(&self, key: &str, body: &str) -> Result<bool> {
        match self.blobs.put_if_absent(&self.bucket, key, body.as_bytes()).await {
            Ok(()) => {
                tracing::info!("Recorded failure {}/{}", self.bucket, key);
                Ok(true)
            }
            Err(StorageError::AlreadyExists { .. }) => {
                tracing::info!("Failure {} already recorded, not rewriting", key);
                Ok(false)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to write error record {}", key)),
        }
    }

    /// Keys recorded for a group on a run date.
    pub async fn entries(&self, run_date: &str, group: EntityGroup) -> Result<Vec<String>> {
        let prefix = format!("{}/{}/", run_date, group.as_str());
        self.blobs
            .list(&self.bucket, &prefix)
            .await
            .with_context(|| format!("Failed to list error records under {}", prefix))
    }

    pub async fn read(&self, key: &str) -> Result<String> {
        let bytes = self
            .blobs
            .get(&self.bucket, key)
            .await
            .with_context(|| format!("Failed to read error record {}", key))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsBlobStore;
    use serde_json::json;
    use tempfile::tempdir;

    fn sink(dir: &std::path::Path) -> ErrorSink {
        ErrorSink::new(Arc::new(FsBlobStore::new(dir)), "errors")
    }

    #[test]
    fn keys_are_dated_and_grouped() {
        assert_eq!(
            item_key("2024-05-01", EntityGroup::Site, "S/1"),
            "2024-05-01/site/2024-05-01_site_S_1.txt"
        );
        let a = run_key("2024-05-01", EntityGroup::Site, "boom");
        assert!(a.starts_with("2024-05-01/site/2024-05-01_site_error_"));
        assert_eq!(a, run_key("2024-05-01", EntityGroup::Site, "boom"));
        assert_ne!(a, run_key("2024-05-01", EntityGroup::Site, "other"));
    }

    #[tokio::test]
    async fn item_records_are_write_once() {
        let dir = tempdir().unwrap();
        let sink = sink(dir.path());
        assert!(sink
            .record_item("2024-05-01", EntityGroup::Site, "S1", "bad address", &json!({"id": "S1"}))
            .await
            .unwrap());
        assert!(!sink
            .record_item("2024-05-01", EntityGroup::Site, "S1", "other", &json!({"id": "S1"}))
            .await
            .unwrap());
        let keys = sink.entries("2024-05-01", EntityGroup::Site).await.unwrap();
        assert_eq!(keys.len(), 1);
        let body = sink.read(&keys[0]).await.unwrap();
        assert!(body.contains("bad address"));
        assert!(!body.contains("other"));
    }

    #[tokio::test]
    async fn run_record_mentions_missing_queue_length() {
        let dir = tempdir().unwrap();
        let sink = sink(dir.path());
        let failure = RunFailure {
            group: EntityGroup::Company,
            run_date: "2024-05-01",
            delta_count: 3,
            queue_length: None,
            cause: "queue is empty",
        };
        assert!(sink.record_run(&failure).await.unwrap());
        assert!(!sink.record_run(&failure).await.unwrap());
        let keys = sink.entries("2024-05-01", EntityGroup::Company).await.unwrap();
        let body = sink.read(&keys[0]).await.unwrap();
        assert!(body.contains("Queue length:\nnone"));
    }
}
