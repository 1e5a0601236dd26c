// ABOUTME: Snapshot rotation - back up every slot, promote new (or reduced) to previous, clean up
// ABOUTME: Backups always run first; a second rotation with no new data leaves previous intact

use anyhow::Result;
use std::collections::{BTreeSet, HashMap};

use crate::config::GroupConfig;
use crate::hierarchy::EntityGroup;
use crate::record::Record;
use crate::storage::{SnapshotStore, Slot};

/// What a rotation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationReport {
    pub backed_up: Vec<Slot>,
    pub promoted: Option<Slot>,
    /// Records whose previous version was kept instead of the promoted one.
    pub withheld: usize,
    pub deleted: Vec<(EntityGroup, Slot)>,
}

fn backup_slots(policy: &GroupConfig) -> Vec<Slot> {
    let mut slots = vec![Slot::New, Slot::Previous];
    if policy.supports_reduction {
        slots.push(Slot::Reduced);
    }
    slots
}

/// Back up all slots of a group under the run date.
pub async fn backup_all(
    snapshots: &SnapshotStore,
    run_date: &str,
    group: EntityGroup,
    policy: &GroupConfig,
) -> Result<Vec<Slot>> {
    let mut copied = Vec::new();
    for slot in backup_slots(policy) {
        if snapshots.backup(run_date, group, slot).await? {
            copied.push(slot);
        }
    }
    tracing::info!("Backed up {} slot(s) of {} under {}", copied.len(), group, run_date);
    Ok(copied)
}

/// Promote `source` into previous, keeping the previous version of every
/// withheld record (or leaving it out when there is none). Returns how many
/// records were withheld, or `None` when `source` does not exist.
async fn promote_withholding(
    snapshots: &SnapshotStore,
    group: EntityGroup,
    source: Slot,
    withheld: &[String],
) -> Result<Option<usize>> {
    let Some(records) = snapshots.read(group, source).await? else {
        return Ok(None);
    };
    let ids: BTreeSet<&str> = withheld.iter().map(String::as_str).collect();
    let mut earlier: HashMap<String, Record> = snapshots
        .read(group, Slot::Previous)
        .await?
        .unwrap_or_default()
        .into_iter()
        .filter(|record| ids.contains(record.id.as_str()))
        .map(|record| (record.id.clone(), record))
        .collect();

    let mut kept = 0;
    let mut promoted = Vec::with_capacity(records.len());
    for record in records {
        if ids.contains(record.id.as_str()) {
            kept += 1;
            if let Some(old) = earlier.remove(&record.id) {
                promoted.push(old);
            }
        } else {
            promoted.push(record);
        }
    }
    snapshots.write(group, Slot::Previous, &promoted).await?;
    Ok(Some(kept))
}

/// Rotate a group's snapshots after a successful run. Records in `withheld`
/// failed to reach the target and keep their previous version.
pub async fn rotate(
    snapshots: &SnapshotStore,
    run_date: &str,
    group: EntityGroup,
    policy: &GroupConfig,
    withheld: &[String],
) -> Result<RotationReport> {
    let mut report = RotationReport {
        backed_up: backup_all(snapshots, run_date, group, policy).await?,
        ..RotationReport::default()
    };

    let source = if policy.supports_reduction {
        Slot::Reduced
    } else {
        Slot::New
    };
    let promoted = if withheld.is_empty() {
        snapshots.copy_slot(group, source, Slot::Previous).await?
    } else {
        match promote_withholding(snapshots, group, source, withheld).await? {
            Some(kept) => {
                tracing::warn!(
                    "{}: {} failed record(s) keep their previous version",
                    group,
                    kept
                );
                report.withheld = kept;
                true
            }
            None => false,
        }
    };
    if promoted {
        tracing::info!("Promoted {} {} to previous", group, source);
        report.promoted = Some(source);
    } else {
        tracing::warn!(
            "{} {} does not exist, previous left unchanged",
            group,
            source
        );
    }

    if policy.supports_reduction {
        snapshots.delete(group, Slot::Reduced).await?;
        report.deleted.push((group, Slot::Reduced));
    }
    if !policy.retain_new {
        snapshots.delete(group, Slot::New).await?;
        report.deleted.push((group, Slot::New));
    }
    for &released in &policy.releases {
        snapshots.delete(released, Slot::New).await?;
        tracing::info!("Released retained {} new snapshot", released);
        report.deleted.push((released, Slot::New));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsBlobStore;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn store(dir: &std::path::Path) -> SnapshotStore {
        SnapshotStore::new(Arc::new(FsBlobStore::new(dir)), "data", "backup")
    }

    #[tokio::test]
    async fn reduced_is_promoted_instead_of_new() {
        let dir = tempdir().unwrap();
        let snapshots = store(dir.path());
        let group = EntityGroup::CostCenter;
        let all = vec![Record::new("1"), Record::new("2")];
        let reduced = vec![Record::new("1")];
        snapshots.write(group, Slot::New, &all).await.unwrap();
        snapshots.write(group, Slot::Reduced, &reduced).await.unwrap();

        let policy = GroupConfig {
            supports_reduction: true,
            reduction_query: Some("SELECT * FROM {new}".into()),
            ..GroupConfig::default()
        };
        let report = rotate(&snapshots, "2024-05-01", group, &policy, &[])
            .await
            .unwrap();
        assert_eq!(report.promoted, Some(Slot::Reduced));
        assert_eq!(
            snapshots.read(group, Slot::Previous).await.unwrap(),
            Some(reduced)
        );
        assert!(!snapshots.exists(group, Slot::New).await.unwrap());
        assert!(!snapshots.exists(group, Slot::Reduced).await.unwrap());
        assert_eq!(
            snapshots
                .read_backup("2024-05-01", group, Slot::New)
                .await
                .unwrap(),
            Some(all)
        );
    }

    #[tokio::test]
    async fn retained_new_is_released_by_later_group() {
        let dir = tempdir().unwrap();
        let snapshots = store(dir.path());
        let records = vec![Record::new("H1")];
        snapshots
            .write(EntityGroup::CompanyHierarchy, Slot::New, &records)
            .await
            .unwrap();
        let retain = GroupConfig {
            retain_new: true,
            ..GroupConfig::default()
        };
        rotate(
            &snapshots,
            "2024-05-01",
            EntityGroup::CompanyHierarchy,
            &retain,
            &[],
        )
            .await
            .unwrap();
        assert!(snapshots
            .exists(EntityGroup::CompanyHierarchy, Slot::New)
            .await
            .unwrap());

        let release = GroupConfig {
            releases: vec![EntityGroup::CompanyHierarchy],
            ..GroupConfig::default()
        };
        rotate(&snapshots, "2024-05-01", EntityGroup::Company, &release, &[])
            .await
            .unwrap();
        assert!(!snapshots
            .exists(EntityGroup::CompanyHierarchy, Slot::New)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn withheld_records_keep_their_previous_version() {
        let dir = tempdir().unwrap();
        let snapshots = store(dir.path());
        let group = EntityGroup::Building;
        let old = vec![
            Record::new("B1").with("name", "Hall"),
            Record::new("B3").with("name", "Annex"),
        ];
        let new = vec![
            Record::new("B1").with("name", "Main hall"),
            Record::new("B2").with("name", "Depot"),
            Record::new("B3").with("name", "North annex"),
        ];
        snapshots.write(group, Slot::Previous, &old).await.unwrap();
        snapshots.write(group, Slot::New, &new).await.unwrap();

        let withheld = vec!["B2".to_string(), "B3".to_string()];
        let report = rotate(
            &snapshots,
            "2024-05-01",
            group,
            &GroupConfig::default(),
            &withheld,
        )
        .await
        .unwrap();
        assert_eq!(report.promoted, Some(Slot::New));
        assert_eq!(report.withheld, 2);
        assert_eq!(
            snapshots.read(group, Slot::Previous).await.unwrap(),
            Some(vec![
                Record::new("B1").with("name", "Main hall"),
                Record::new("B3").with("name", "Annex"),
            ])
        );
    }
}
