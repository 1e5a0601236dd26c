// ABOUTME: TOML configuration for groups, queues, detector polling, storage and target endpoint
// ABOUTME: Config::default() encodes the standard company -> cost center / location sequence

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hierarchy::EntityGroup;

/// Environment variable consulted for the target API key when the config
/// file does not set one.
pub const API_KEY_ENV: &str = "HIERARCHY_SYNC_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-group policy, keyed by group name (e.g. `cost_center`).
    pub groups: BTreeMap<String, GroupConfig>,
    pub queue: QueueConfig,
    pub detector: DetectorConfig,
    pub storage: StorageConfig,
    pub target: TargetConfig,
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// FIFO queue with per-run group key; unordered groups use a standard queue.
    pub ordered: bool,
    pub halt_on_failure: bool,
    /// Runs REDUCE before DETECT and rotates `reduced` instead of `new`.
    pub supports_reduction: bool,
    /// Keep the `new` slot after rotation for a later group to read.
    pub retain_new: bool,
    /// Groups whose retained `new` slot is deleted when this group rotates.
    pub releases: Vec<EntityGroup>,
    /// Groups triggered after this group succeeds.
    pub next: Vec<EntityGroup>,
    pub delta_query: String,
    pub reduction_query: Option<String>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            ordered: true,
            halt_on_failure: true,
            supports_reduction: false,
            retain_new: false,
            releases: Vec::new(),
            next: Vec::new(),
            delta_query: DEFAULT_DELTA_QUERY.to_string(),
            reduction_query: None,
        }
    }
}

/// Rows of the current slot that are new or differ from `previous`, in
/// snapshot order.
pub const DEFAULT_DELTA_QUERY: &str = "SELECT * FROM {current} WHERE id IN \
(SELECT id FROM (SELECT * FROM {current} EXCEPT SELECT * FROM {previous})) ORDER BY rowid";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_batch: usize,
    pub max_message_id_len: usize,
    pub settle_delay_ms: u64,
    pub inflight_wait_attempts: u32,
    pub inflight_wait_interval_ms: u64,
    pub purge_cooldown_ms: u64,
    pub visibility_timeout_secs: u64,
    /// Deliveries a failing message gets under a non-halting policy before it
    /// is withheld from rotation and removed.
    pub max_receive_count: u32,
    /// Concurrent consumers draining an unordered queue.
    pub workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_batch: 10,
            max_message_id_len: 80,
            settle_delay_ms: 2_000,
            inflight_wait_attempts: 6,
            inflight_wait_interval_ms: 10_000,
            purge_cooldown_ms: 60_000,
            visibility_timeout_secs: 300,
            max_receive_count: 3,
            workers: 4,
        }
    }
}

impl QueueConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn inflight_wait_interval(&self) -> Duration {
        Duration::from_millis(self.inflight_wait_interval_ms)
    }

    pub fn purge_cooldown(&self) -> Duration {
        Duration::from_millis(self.purge_cooldown_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub poll_interval_ms: u64,
    pub max_polls: u32,
    pub page_size: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            max_polls: 90,
            page_size: 50,
        }
    }
}

impl DetectorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Upper bound on one detection, materializing and paging included.
    pub fn deadline(&self) -> Duration {
        self.poll_interval()
            .saturating_mul(self.max_polls.max(1).saturating_add(1))
            .saturating_add(Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for blob buckets and databases.
    pub root: PathBuf,
    pub data_bucket: String,
    pub backup_bucket: String,
    pub errors_bucket: String,
    /// Directory holding one queue database per group. Relative paths are
    /// resolved against `root`.
    pub queue_dir: PathBuf,
    pub analytics_db: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let root = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("hierarchy-sync");
        Self {
            root,
            data_bucket: "data".to_string(),
            backup_bucket: "backup".to_string(),
            errors_bucket: "errors".to_string(),
            queue_dir: PathBuf::from("queues"),
            analytics_db: PathBuf::from("analytics.db"),
        }
    }
}

impl StorageConfig {
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn queue_path(&self, group: EntityGroup) -> PathBuf {
        self.resolve(&self.queue_dir)
            .join(format!("{}.db", group.as_str()))
    }

    pub fn analytics_path(&self) -> PathBuf {
        self.resolve(&self.analytics_db)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub api_key: Option<String>,
    /// Time profile assigned to sites that do not exist in the target yet.
    pub default_time_profile: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout_secs: 30,
            api_key: None,
            default_time_profile: "Standard_Hours_40".to_string(),
        }
    }
}

impl TargetConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// JSON file with per-country address rules. Without it sites pass
    /// validation unchanged.
    pub rules_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        use EntityGroup::*;

        let mut groups = BTreeMap::new();
        groups.insert(
            CompanyHierarchy.as_str().to_string(),
            GroupConfig {
                retain_new: true,
                next: vec![Company],
                ..GroupConfig::default()
            },
        );
        groups.insert(
            Company.as_str().to_string(),
            GroupConfig {
                releases: vec![CompanyHierarchy],
                next: vec![CostCenterHierarchy, LocationHierarchy],
                ..GroupConfig::default()
            },
        );
        groups.insert(
            CostCenterHierarchy.as_str().to_string(),
            GroupConfig {
                next: vec![CostCenter],
                ..GroupConfig::default()
            },
        );
        groups.insert(
            CostCenter.as_str().to_string(),
            GroupConfig {
                ordered: false,
                halt_on_failure: false,
                supports_reduction: true,
                reduction_query: Some(
                    "SELECT * FROM {new} WHERE companycode IN \
                     (SELECT id FROM {company_previous}) ORDER BY rowid"
                        .to_string(),
                ),
                ..GroupConfig::default()
            },
        );
        groups.insert(
            LocationHierarchy.as_str().to_string(),
            GroupConfig {
                next: vec![Site],
                ..GroupConfig::default()
            },
        );
        groups.insert(
            Site.as_str().to_string(),
            GroupConfig {
                next: vec![Building],
                ..GroupConfig::default()
            },
        );
        groups.insert(
            Building.as_str().to_string(),
            GroupConfig {
                halt_on_failure: false,
                ..GroupConfig::default()
            },
        );

        Self {
            groups,
            queue: QueueConfig::default(),
            detector: DetectorConfig::default(),
            storage: StorageConfig::default(),
            target: TargetConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl Config {
    /// Load a TOML config file. Groups missing from the file keep their
    /// built-in policy.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file {:?}", path))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let parsed: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        let mut config = Config {
            groups: Config::default().groups,
            ..parsed.clone()
        };
        config.groups.extend(parsed.groups);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, group) in &self.groups {
            let parsed: EntityGroup = name.parse()?;
            if group.supports_reduction && group.reduction_query.is_none() {
                bail!("group '{}' supports reduction but has no reduction_query", name);
            }
            if group.next.contains(&parsed) {
                bail!("group '{}' lists itself in next", name);
            }
        }
        if self.queue.max_batch == 0 || self.queue.max_batch > work_queue::MAX_BATCH_SIZE {
            bail!(
                "queue.max_batch must be between 1 and {}",
                work_queue::MAX_BATCH_SIZE
            );
        }
        if self.queue.max_message_id_len < 2 {
            bail!("queue.max_message_id_len must be at least 2");
        }
        if self.queue.max_receive_count == 0 {
            bail!("queue.max_receive_count must be at least 1");
        }
        Ok(())
    }

    /// Policy for a group, falling back to defaults for unlisted groups.
    pub fn group(&self, group: EntityGroup) -> GroupConfig {
        self.groups
            .get(group.as_str())
            .cloned()
            .unwrap_or_default()
    }
}
