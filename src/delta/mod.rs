// ABOUTME: Delta detection - runs a comparison query against the analytical store
// ABOUTME: Polls the query to a terminal state and pages results into records

pub mod sqlite;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::config::DetectorConfig;
use crate::errors::{PipelineError, PipelineResult};
use crate::hierarchy::EntityGroup;
use crate::record::Record;
use crate::storage::{SnapshotStore, Slot};
use crate::utils::{poll_fixed_interval, Poll};

pub use sqlite::SqliteQueryEngine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryState {
    Queued,
    Running,
    Succeeded,
    Failed(String),
    Cancelled(String),
}

impl QueryState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueryState::Queued | QueryState::Running)
    }
}

/// One page of raw result rows. The first row of the first page is the
/// column header.
#[derive(Debug, Clone, Default)]
pub struct ResultPage {
    pub rows: Vec<Vec<String>>,
    pub next_token: Option<String>,
}

#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Submit a query and return its execution id.
    async fn start(&self, sql: &str) -> Result<String>;

    async fn status(&self, query_id: &str) -> Result<QueryState>;

    async fn page(&self, query_id: &str, token: Option<&str>, size: usize) -> Result<ResultPage>;

    /// Replace a table with the given columns and records, in order.
    async fn load_table(&self, name: &str, columns: &[String], records: &[Record]) -> Result<()>;
}

/// Result of a delta query.
#[derive(Debug, Clone)]
pub struct Detection {
    pub query_id: String,
    pub records: Vec<Record>,
}

pub struct DeltaDetector {
    engine: Arc<dyn QueryEngine>,
    config: DetectorConfig,
}

impl DeltaDetector {
    pub fn new(engine: Arc<dyn QueryEngine>, config: DetectorConfig) -> Self {
        Self { engine, config }
    }

    /// Materialize the snapshot slots a query template references, then run
    /// it and collect the resulting records.
    pub async fn detect(
        &self,
        snapshots: &SnapshotStore,
        group: EntityGroup,
        current: Slot,
        template: &str,
    ) -> PipelineResult<Detection> {
        let sql = render_query(template, group, current);
        let tables = referenced_tables(template, group, current);
        materialize(self.engine.as_ref(), snapshots, &tables).await?;

        tracing::info!("Running delta query for {}", group);
        tracing::debug!("{}", sql);
        let query_id = self.run(&sql).await?;
        let records = self.fetch(&query_id).await?;
        tracing::info!(
            "Query {} for {} returned {} delta(s)",
            query_id,
            group,
            records.len()
        );
        Ok(Detection { query_id, records })
    }

    /// Start a query and wait until it succeeds.
    pub async fn run(&self, sql: &str) -> PipelineResult<String> {
        let query_id = self.engine.start(sql).await?;
        let engine = &self.engine;
        let id = query_id.as_str();
        let state = poll_fixed_interval(
            || async move {
                let state = engine.status(id).await?;
                Ok(if state.is_terminal() {
                    Poll::Ready(state)
                } else {
                    Poll::Pending
                })
            },
            self.config.max_polls,
            self.config.poll_interval(),
            "delta query",
        )
        .await?;

        match state {
            Some(QueryState::Succeeded) => Ok(query_id),
            Some(QueryState::Failed(reason)) | Some(QueryState::Cancelled(reason)) => {
                Err(PipelineError::QueryExecution { query_id, reason })
            }
            Some(other) => Err(PipelineError::QueryExecution {
                query_id,
                reason: format!("unexpected state {:?}", other),
            }),
            None => Err(PipelineError::QueryExecution {
                reason: format!(
                    "still running after {} polls",
                    self.config.max_polls.max(1)
                ),
                query_id,
            }),
        }
    }

    /// Page through the results of a finished query. Safe to call again from
    /// a later invocation with the same query id.
    pub async fn fetch(&self, query_id: &str) -> PipelineResult<Vec<Record>> {
        let mut token: Option<String> = None;
        let mut header: Option<Vec<String>> = None;
        let mut records = Vec::new();
        loop {
            let page = self
                .engine
                .page(query_id, token.as_deref(), self.config.page_size.max(1))
                .await
                .with_context(|| format!("Failed to read results of query {}", query_id))?;
            for row in page.rows {
                match &header {
                    None => header = Some(row),
                    Some(columns) => records.push(Record::from_row(columns, &row)?),
                }
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(records)
    }

    /// Run the detector with an overall deadline set by the caller.
    pub async fn detect_within(
        &self,
        deadline: Duration,
        snapshots: &SnapshotStore,
        group: EntityGroup,
        current: Slot,
        template: &str,
    ) -> PipelineResult<Detection> {
        match tokio::time::timeout(deadline, self.detect(snapshots, group, current, template))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::QueryExecution {
                query_id: String::new(),
                reason: format!("timed out after {:?}", deadline),
            }),
        }
    }
}

/// Table name of a group's slot in the analytical store.
pub fn table_name(group: EntityGroup, slot: Slot) -> String {
    format!("{}_{}", group.as_str(), slot.as_str())
}

/// Substitute `{current}`, `{new}`, `{previous}`, `{reduced}` and
/// `{<group>_<slot>}` placeholders with table names.
pub fn render_query(template: &str, group: EntityGroup, current: Slot) -> String {
    let mut sql = template.replace("{current}", &table_name(group, current));
    for slot in Slot::ALL {
        sql = sql.replace(&format!("{{{}}}", slot.as_str()), &table_name(group, slot));
    }
    for other in EntityGroup::ALL {
        for slot in Slot::ALL {
            let name = table_name(other, slot);
            sql = sql.replace(&format!("{{{}}}", name), &name);
        }
    }
    sql
}

/// Slots a template reads, as (group, slot) pairs.
pub fn referenced_tables(
    template: &str,
    group: EntityGroup,
    current: Slot,
) -> BTreeSet<(EntityGroup, Slot)> {
    let mut tables = BTreeSet::new();
    if template.contains("{current}") {
        tables.insert((group, current));
    }
    for slot in Slot::ALL {
        if template.contains(&format!("{{{}}}", slot.as_str())) {
            tables.insert((group, slot));
        }
    }
    for other in EntityGroup::ALL {
        for slot in Slot::ALL {
            if template.contains(&format!("{{{}}}", table_name(other, slot))) {
                tables.insert((other, slot));
            }
        }
    }
    tables
}

/// Load snapshot slots into the query engine. Slots of the same group share
/// the union of their columns so set operations line up; missing values and
/// missing slots become empty strings and empty tables.
pub async fn materialize(
    engine: &dyn QueryEngine,
    snapshots: &SnapshotStore,
    tables: &BTreeSet<(EntityGroup, Slot)>,
) -> Result<()> {
    let mut contents: Vec<(EntityGroup, Slot, Vec<Record>)> = Vec::new();
    let mut columns: BTreeMap<EntityGroup, BTreeSet<String>> = BTreeMap::new();

    for &(group, slot) in tables {
        let records = snapshots.read(group, slot).await?.unwrap_or_default();
        let set = columns.entry(group).or_default();
        for record in &records {
            set.extend(record.fields.keys().cloned());
        }
        contents.push((group, slot, records));
    }

    for (group, slot, records) in contents {
        let mut cols = vec!["id".to_string()];
        if let Some(set) = columns.get(&group) {
            cols.extend(set.iter().cloned());
        }
        let name = table_name(group, slot);
        tracing::debug!("Loading {} row(s) into {}", records.len(), name);
        engine
            .load_table(&name, &cols, &records)
            .await
            .with_context(|| format!("Failed to load table {}", name))?;
    }
    Ok(())
}
