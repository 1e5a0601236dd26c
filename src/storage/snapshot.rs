// ABOUTME: SnapshotStore - new/previous/reduced record collections per entity group
// ABOUTME: Stored as JSON lines in the data bucket, with dated backups in the backup bucket

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::{BlobStore, StorageError};
use crate::hierarchy::EntityGroup;
use crate::record::{parse_json_lines, to_json_lines, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    New,
    Previous,
    Reduced,
}

impl Slot {
    pub const ALL: [Slot; 3] = [Slot::New, Slot::Previous, Slot::Reduced];

    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::New => "new",
            Slot::Previous => "previous",
            Slot::Reduced => "reduced",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Object key of a slot inside the data bucket.
pub fn slot_key(group: EntityGroup, slot: Slot) -> String {
    format!("{}_{}_run.json", group.as_str(), slot.as_str())
}

/// Object key of a dated slot backup inside the backup bucket.
pub fn backup_key(run_date: &str, group: EntityGroup, slot: Slot) -> String {
    format!("{}/{}", run_date, slot_key(group, slot))
}

#[derive(Clone)]
pub struct SnapshotStore {
    blobs: Arc<dyn BlobStore>,
    data_bucket: String,
    backup_bucket: String,
}

impl SnapshotStore {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        data_bucket: impl Into<String>,
        backup_bucket: impl Into<String>,
    ) -> Self {
        Self {
            blobs,
            data_bucket: data_bucket.into(),
            backup_bucket: backup_bucket.into(),
        }
    }

    pub fn data_bucket(&self) -> &str {
        &self.data_bucket
    }

    /// Records in a slot, or `None` when the slot does not exist.
    pub async fn read(&self, group: EntityGroup, slot: Slot) -> Result<Option<Vec<Record>>> {
        let key = slot_key(group, slot);
        match self.blobs.get(&self.data_bucket, &key).await {
            Ok(bytes) => {
                let text = String::from_utf8(bytes)
                    .with_context(|| format!("Snapshot {} is not valid UTF-8", key))?;
                let records = parse_json_lines(&text)
                    .with_context(|| format!("Failed to parse snapshot {}", key))?;
                Ok(Some(records))
            }
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read snapshot {}", key)),
        }
    }

    pub async fn write(&self, group: EntityGroup, slot: Slot, records: &[Record]) -> Result<()> {
        let key = slot_key(group, slot);
        let body = to_json_lines(records)?;
        self.blobs
            .put(&self.data_bucket, &key, body.as_bytes())
            .await
            .with_context(|| format!("Failed to write snapshot {}", key))
    }

    pub async fn exists(&self, group: EntityGroup, slot: Slot) -> Result<bool> {
        Ok(self.read(group, slot).await?.is_some())
    }

    /// Copy one slot to another. Returns `false` when the source is missing,
    /// leaving the destination untouched.
    pub async fn copy_slot(&self, group: EntityGroup, from: Slot, to: Slot) -> Result<bool> {
        let (src, dst) = (slot_key(group, from), slot_key(group, to));
        match self
            .blobs
            .copy(&self.data_bucket, &src, &self.data_bucket, &dst)
            .await
        {
            Ok(()) => Ok(true),
            Err(StorageError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to copy {} to {}", src, dst)),
        }
    }

    pub async fn delete(&self, group: EntityGroup, slot: Slot) -> Result<()> {
        let key = slot_key(group, slot);
        self.blobs
            .delete(&self.data_bucket, &key)
            .await
            .with_context(|| format!("Failed to delete snapshot {}", key))
    }

    /// Back up a slot under the run date. A missing slot is backed up as an
    /// empty placeholder so the archive always has every slot; an earlier
    /// backup under the same date is kept. Returns `true` when real content
    /// was copied.
    pub async fn backup(&self, run_date: &str, group: EntityGroup, slot: Slot) -> Result<bool> {
        let src = slot_key(group, slot);
        let dst = backup_key(run_date, group, slot);
        match self
            .blobs
            .copy(&self.data_bucket, &src, &self.backup_bucket, &dst)
            .await
        {
            Ok(()) => Ok(true),
            Err(StorageError::NotFound { .. }) => {
                tracing::warn!("{} does not exist, writing empty backup {}", src, dst);
                match self.blobs.put_if_absent(&self.backup_bucket, &dst, b"").await {
                    Ok(()) | Err(StorageError::AlreadyExists { .. }) => Ok(false),
                    Err(e) => Err(e)
                        .with_context(|| format!("Failed to write placeholder backup {}", dst)),
                }
            }
            Err(e) => Err(e).with_context(|| format!("Failed to back up {} to {}", src, dst)),
        }
    }

    pub async fn read_backup(
        &self,
        run_date: &str,
        group: EntityGroup,
        slot: Slot,
    ) -> Result<Option<Vec<Record>>> {
        let key = backup_key(run_date, group, slot);
        match self.blobs.get(&self.backup_bucket, &key).await {
            Ok(bytes) => {
                let text = String::from_utf8(bytes)
                    .with_context(|| format!("Backup {} is not valid UTF-8", key))?;
                Ok(Some(parse_json_lines(&text)?))
            }
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read backup {}", key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsBlobStore;
    use tempfile::tempdir;

    fn store(dir: &std::path::Path) -> SnapshotStore {
        SnapshotStore::new(Arc::new(FsBlobStore::new(dir)), "data", "backup")
    }

    #[test]
    fn keys_follow_naming() {
        assert_eq!(slot_key(EntityGroup::Company, Slot::New), "company_new_run.json");
        assert_eq!(
            backup_key("2024-03-01", EntityGroup::CostCenter, Slot::Reduced),
            "2024-03-01/cost_center_reduced_run.json"
        );
    }

    #[tokio::test]
    async fn write_read_and_copy() {
        let dir = tempdir().unwrap();
        let snapshots = store(dir.path());
        let records = vec![Record::new("1").with("name", "One")];

        assert!(snapshots.read(EntityGroup::Site, Slot::New).await.unwrap().is_none());
        snapshots.write(EntityGroup::Site, Slot::New, &records).await.unwrap();
        assert!(snapshots
            .copy_slot(EntityGroup::Site, Slot::New, Slot::Previous)
            .await
            .unwrap());
        assert_eq!(
            snapshots
                .read(EntityGroup::Site, Slot::Previous)
                .await
                .unwrap()
                .unwrap(),
            records
        );
        assert!(!snapshots
            .copy_slot(EntityGroup::Site, Slot::Reduced, Slot::Previous)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn backup_of_missing_slot_is_placeholder() {
        let dir = tempdir().unwrap();
        let snapshots = store(dir.path());
        assert!(!snapshots
            .backup("2024-03-01", EntityGroup::Site, Slot::New)
            .await
            .unwrap());
        let backup = snapshots
            .read_backup("2024-03-01", EntityGroup::Site, Slot::New)
            .await
            .unwrap();
        assert_eq!(backup, Some(Vec::new()));
    }

    #[tokio::test]
    async fn placeholder_does_not_replace_earlier_backup() {
        let dir = tempdir().unwrap();
        let snapshots = store(dir.path());
        let records = vec![Record::new("1")];
        snapshots.write(EntityGroup::Site, Slot::New, &records).await.unwrap();
        assert!(snapshots
            .backup("2024-03-01", EntityGroup::Site, Slot::New)
            .await
            .unwrap());
        snapshots.delete(EntityGroup::Site, Slot::New).await.unwrap();
        assert!(!snapshots
            .backup("2024-03-01", EntityGroup::Site, Slot::New)
            .await
            .unwrap());
        let backup = snapshots
            .read_backup("2024-03-01", EntityGroup::Site, Slot::New)
            .await
            .unwrap();
        assert_eq!(backup, Some(records));
    }
}
