// ABOUTME: StageContext - the per-process collaborators every stage invocation uses
// ABOUTME: Builds storage, query engine and validator; target client and queues are opened lazily

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use work_queue::QueueKind;

use crate::config::Config;
use crate::delta::sqlite::SqliteQueryEngine;
use crate::delta::{DeltaDetector, QueryEngine};
use crate::error_sink::ErrorSink;
use crate::hierarchy::EntityGroup;
use crate::queue::{open_durable, QueueBackend, WorkQueue};
use crate::storage::{BlobStore, FsBlobStore, SnapshotStore};
use crate::submit::{
    AcceptAll, AddressRules, HttpTargetClient, RecordValidator, Submitter, TargetClient,
};

pub struct StageContext {
    pub config: Config,
    pub snapshots: SnapshotStore,
    pub errors: ErrorSink,
    pub detector: DeltaDetector,
    validator: Arc<dyn RecordValidator>,
    target: OnceCell<Arc<dyn TargetClient>>,
    queues: Mutex<HashMap<EntityGroup, Arc<dyn QueueBackend>>>,
}

impl StageContext {
    /// Open the default collaborators described by the configuration.
    pub fn open(config: Config) -> Result<Self> {
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.storage.root.clone()));
        let analytics = config.storage.analytics_path();
        let engine: Arc<dyn QueryEngine> = Arc::new(SqliteQueryEngine::open(&analytics)?);
        let validator: Arc<dyn RecordValidator> = match &config.validation.rules_file {
            Some(path) => Arc::new(AddressRules::load(path)?),
            None => {
                tracing::warn!("No address rules configured, every record passes validation");
                Arc::new(AcceptAll)
            }
        };
        Ok(Self::new(config, blobs, engine, validator))
    }

    pub fn new(
        config: Config,
        blobs: Arc<dyn BlobStore>,
        engine: Arc<dyn QueryEngine>,
        validator: Arc<dyn RecordValidator>,
    ) -> Self {
        let storage = &config.storage;
        let snapshots = SnapshotStore::new(
            blobs.clone(),
            storage.data_bucket.clone(),
            storage.backup_bucket.clone(),
        );
        let errors = ErrorSink::new(blobs, storage.errors_bucket.clone());
        let detector = DeltaDetector::new(engine, config.detector.clone());
        Self {
            config,
            snapshots,
            errors,
            detector,
            validator,
            target: OnceCell::new(),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Use an already constructed target client instead of the HTTP one.
    pub fn with_target(mut self, target: Arc<dyn TargetClient>) -> Self {
        self.target = OnceCell::from(target);
        self
    }

    /// The target client, built on first use and reused afterwards.
    pub async fn target(&self) -> Result<Arc<dyn TargetClient>> {
        let target = self
            .target
            .get_or_try_init(|| async {
                let client = HttpTargetClient::new(&self.config.target)?;
                Ok::<Arc<dyn TargetClient>, anyhow::Error>(Arc::new(client))
            })
            .await?;
        Ok(target.clone())
    }

    pub async fn submitter(&self) -> Result<Submitter> {
        Ok(Submitter::new(
            self.target().await?,
            self.validator.clone(),
            self.errors.clone(),
            self.config.target.default_time_profile.clone(),
        ))
    }

    /// The work queue of a group. The backend is opened once per process.
    pub fn queue(&self, group: EntityGroup) -> Result<WorkQueue> {
        let backend = {
            let mut queues = self
                .queues
                .lock()
                .map_err(|_| anyhow::anyhow!("queue cache lock poisoned"))?;
            match queues.get(&group) {
                Some(backend) => backend.clone(),
                None => {
                    let kind = if self.config.group(group).ordered {
                        QueueKind::Fifo
                    } else {
                        QueueKind::Standard
                    };
                    let path = self.config.storage.queue_path(group);
                    let queue = open_durable(
                        &path,
                        kind,
                        self.config.queue.visibility_timeout(),
                        self.config.queue.purge_cooldown(),
                    )
                    .with_context(|| format!("Failed to open queue for {}", group))?;
                    let backend: Arc<dyn QueueBackend> = Arc::new(queue);
                    queues.insert(group, backend.clone());
                    backend
                }
            }
        };
        Ok(WorkQueue::new(
            backend,
            self.config.queue.clone(),
            format!("{}-queue", group),
        ))
    }
}
