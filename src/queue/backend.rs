// ABOUTME: QueueBackend - the batch send/receive/delete/attributes/purge contract of a durable queue
// ABOUTME: Implemented for the SQLite-backed work-queue crate

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use work_queue::{
    BatchOutcome, DeleteEntry, DurableQueue, OutgoingMessage, QueueAttributes, QueueError,
    QueueKind, QueueOptions, ReceivedMessage, SendOutcome,
};

/// Result of a purge request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeStatus {
    Purged(u64),
    /// A previous purge is still settling; retry after the given delay.
    Busy(Duration),
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn kind(&self) -> QueueKind;

    async fn send_batch(&self, entries: Vec<OutgoingMessage>) -> Result<SendOutcome>;

    async fn receive(&self, max: usize) -> Result<Vec<ReceivedMessage>>;

    async fn delete_batch(&self, entries: Vec<DeleteEntry>) -> Result<BatchOutcome>;

    /// Make an in-flight message visible again after `timeout`.
    async fn release(&self, receipt_handle: &str, timeout: Duration) -> Result<bool>;

    async fn attributes(&self) -> Result<QueueAttributes>;

    async fn purge(&self) -> Result<PurgeStatus>;
}

/// Open the durable queue of one group.
pub fn open_durable(
    path: &Path,
    kind: QueueKind,
    visibility_timeout: Duration,
    purge_interval: Duration,
) -> Result<DurableQueue> {
    DurableQueue::open(
        path,
        QueueOptions {
            kind,
            visibility_timeout,
            purge_interval,
        },
    )
    .with_context(|| format!("Failed to open queue at {:?}", path))
}

#[async_trait]
impl QueueBackend for DurableQueue {
    fn kind(&self) -> QueueKind {
        DurableQueue::kind(self)
    }

    async fn send_batch(&self, entries: Vec<OutgoingMessage>) -> Result<SendOutcome> {
        DurableQueue::send_batch(self, &entries).context("send_batch failed")
    }

    async fn receive(&self, max: usize) -> Result<Vec<ReceivedMessage>> {
        DurableQueue::receive(self, max).context("receive failed")
    }

    async fn delete_batch(&self, entries: Vec<DeleteEntry>) -> Result<BatchOutcome> {
        DurableQueue::delete_batch(self, &entries).context("delete_batch failed")
    }

    async fn release(&self, receipt_handle: &str, timeout: Duration) -> Result<bool> {
        DurableQueue::change_visibility(self, receipt_handle, timeout)
            .context("change_visibility failed")
    }

    async fn attributes(&self) -> Result<QueueAttributes> {
        DurableQueue::attributes(self).context("Failed to read queue attributes")
    }

    async fn purge(&self) -> Result<PurgeStatus> {
        match DurableQueue::purge(self) {
            Ok(removed) => Ok(PurgeStatus::Purged(removed)),
            Err(QueueError::PurgeInProgress { retry_after }) => Ok(PurgeStatus::Busy(retry_after)),
            Err(e) => Err(e).context("purge failed"),
        }
    }
}
