// ABOUTME: WorkQueue - the enqueue/drain/ack/length/purge protocol over a queue backend
// ABOUTME: Enforces chunking, in-flight drain waits and the always-fatal protocol checks

pub mod backend;

use anyhow::Context;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use work_queue::{DeleteEntry, OutgoingMessage, QueueAttributes, QueueKind, EXPIRED_RECEIPT};

use crate::config::QueueConfig;
use crate::errors::{PipelineError, PipelineResult};
use crate::record::Record;
use crate::utils::{poll_fixed_interval, truncate_chars, Poll};

pub use backend::{open_durable, PurgeStatus, QueueBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LengthMode {
    Visible,
    #[value(name = "inflight")]
    #[serde(rename = "inflight")]
    InFlight,
    Delayed,
    Total,
}

impl LengthMode {
    pub fn pick(&self, attrs: &QueueAttributes) -> u64 {
        match self {
            LengthMode::Visible => attrs.visible,
            LengthMode::InFlight => attrs.in_flight,
            LengthMode::Delayed => attrs.delayed,
            LengthMode::Total => attrs.total(),
        }
    }
}

impl fmt::Display for LengthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LengthMode::Visible => "visible",
            LengthMode::InFlight => "inflight",
            LengthMode::Delayed => "delayed",
            LengthMode::Total => "total",
        })
    }
}

/// A received record together with the handle needed to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub record: Record,
    pub receive_count: u32,
}

/// Message id for the item at `index` of `total`, scoped by the query id and
/// cut to fit the backend's id limit.
pub fn message_id(index: usize, total: usize, query_id: &str, max_len: usize) -> String {
    let full = format!("{:06}-{:06}_{}", index, total, query_id);
    truncate_chars(&full, max_len.saturating_sub(1)).to_string()
}

pub struct WorkQueue {
    backend: Arc<dyn QueueBackend>,
    settings: QueueConfig,
    label: String,
}

impl WorkQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, settings: QueueConfig, label: impl Into<String>) -> Self {
        Self {
            backend,
            settings,
            label: label.into(),
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.backend.kind() == QueueKind::Fifo
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Enqueue records in chunks of at most `max_batch`. On an ordered queue
    /// every message carries the query id as its group key so one run's
    /// records serialize together.
    pub async fn enqueue_batch(&self, records: &[Record], query_id: &str) -> PipelineResult<usize> {
        let total = records.len();
        let chunk_size = self.settings.max_batch.max(1);
        let ordered = self.is_ordered();
        let mut sent = 0;

        for (chunk_no, chunk) in records.chunks(chunk_size).enumerate() {
            let offset = chunk_no * chunk_size;
            let mut entries = Vec::with_capacity(chunk.len());
            for (i, record) in chunk.iter().enumerate() {
                let id = message_id(offset + i, total, query_id, self.settings.max_message_id_len);
                let body = serde_json::to_string(record)
                    .with_context(|| format!("Failed to serialize record {}", record.id))?;
                let mut message = OutgoingMessage::new(id, body);
                if ordered {
                    message = message.with_group(query_id);
                }
                entries.push(message);
            }

            let outcome = self.backend.send_batch(entries).await?;
            if outcome.successful.len() < chunk.len() {
                let failures = outcome
                    .failed
                    .iter()
                    .map(|f| format!("{}: {}", f.entry_id, f.reason))
                    .collect::<Vec<_>>()
                    .join("; ");
                tracing::error!(
                    "{}: queue accepted {} of {} messages at offset {}",
                    self.label,
                    outcome.successful.len(),
                    chunk.len(),
                    offset
                );
                return Err(PipelineError::PartialSend {
                    sent: outcome.successful.len(),
                    expected: chunk.len(),
                    failures,
                });
            }
            sent += outcome.successful.len();
        }

        tracing::info!("{}: enqueued {} message(s)", self.label, sent);
        Ok(sent)
    }

    /// Message counts after the settle delay. Counts read immediately after
    /// producer activity are not trusted.
    async fn settled_attributes(&self) -> PipelineResult<QueueAttributes> {
        tokio::time::sleep(self.settings.settle_delay()).await;
        Ok(self.backend.attributes().await?)
    }

    pub async fn length(&self, mode: LengthMode) -> PipelineResult<u64> {
        let attrs = self.settled_attributes().await?;
        Ok(mode.pick(&attrs))
    }

    /// Receive the next batch under the drain protocol.
    ///
    /// On an ordered queue this first waits for every in-flight message to be
    /// acknowledged and fails with `StuckInFlight` when they never are. An
    /// empty queue is a protocol violation, but a backend that hands out
    /// nothing despite visible messages yields an empty batch.
    pub async fn drain_batch(&self) -> PipelineResult<Vec<QueueMessage>> {
        let attrs = if self.is_ordered() {
            let attempts = self.settings.inflight_wait_attempts.max(1);
            let this = self;
            let waited = poll_fixed_interval(
                || async move {
                    tokio::time::sleep(this.settings.settle_delay()).await;
                    let attrs = this.backend.attributes().await?;
                    Ok(if attrs.in_flight == 0 {
                        Poll::Ready(attrs)
                    } else {
                        Poll::Pending
                    })
                },
                attempts,
                self.settings.inflight_wait_interval(),
                "in-flight drain",
            )
            .await?;
            match waited {
                Some(attrs) => attrs,
                None => {
                    let attrs = self.backend.attributes().await?;
                    tracing::error!(
                        "{}: {} message(s) stuck in flight",
                        self.label,
                        attrs.in_flight
                    );
                    return Err(PipelineError::StuckInFlight {
                        attempts,
                        in_flight: attrs.in_flight,
                    });
                }
            }
        } else {
            self.settled_attributes().await?
        };

        if attrs.visible == 0 {
            return Err(PipelineError::EmptyQueue);
        }

        let messages = self.poll_batch().await?;
        if messages.is_empty() {
            tracing::warn!(
                "{}: {} visible message(s) but none received",
                self.label,
                attrs.visible
            );
        }
        Ok(messages)
    }

    /// Receive up to `max_batch` messages without the drain checks.
    pub async fn poll_batch(&self) -> PipelineResult<Vec<QueueMessage>> {
        let received = self.backend.receive(self.settings.max_batch).await?;
        let mut messages = Vec::with_capacity(received.len());
        for msg in received {
            let record: Record = serde_json::from_str(&msg.body)
                .with_context(|| format!("Malformed message body for {}", msg.message_id))?;
            messages.push(QueueMessage {
                message_id: msg.message_id,
                receipt_handle: msg.receipt_handle,
                record,
                receive_count: msg.receive_count,
            });
        }
        tracing::debug!("{}: received {} message(s)", self.label, messages.len());
        Ok(messages)
    }

    /// Delete messages by handle, at most `max_batch` per request. Any failed
    /// deletion is fatal: the message will be delivered again.
    pub async fn ack_batch(&self, messages: &[QueueMessage]) -> PipelineResult<()> {
        let mut reasons = Vec::new();
        for chunk in messages.chunks(self.settings.max_batch.max(1)) {
            let entries = chunk
                .iter()
                .enumerate()
                .map(|(i, m)| DeleteEntry {
                    entry_id: i.to_string(),
                    receipt_handle: m.receipt_handle.clone(),
                })
                .collect();
            let outcome = self.backend.delete_batch(entries).await?;
            for failure in outcome.failed {
                let item = failure
                    .entry_id
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| chunk.get(i))
                    .map(|m| m.record.id.as_str())
                    .unwrap_or("?");
                let mut reason = format!("{}: {}", item, failure.reason);
                if failure.reason == EXPIRED_RECEIPT {
                    reason.push_str(" (raise the visibility timeout)");
                }
                reasons.push(reason);
            }
        }
        if reasons.is_empty() {
            return Ok(());
        }
        tracing::error!("{}: failed to delete messages: {}", self.label, reasons.join("; "));
        Err(PipelineError::Ack {
            failed: reasons.len(),
            reasons: reasons.join("; "),
        })
    }

    /// Make messages visible again immediately. A handle that already
    /// expired needs no release; the message is visible again anyway.
    pub async fn release(&self, messages: &[QueueMessage]) -> PipelineResult<()> {
        for message in messages {
            let released = self
                .backend
                .release(&message.receipt_handle, std::time::Duration::ZERO)
                .await?;
            if !released {
                tracing::warn!(
                    "{}: handle of {} expired before release",
                    self.label,
                    message.record.id
                );
            }
        }
        Ok(())
    }

    /// Deliveries a failing message gets before it is given up on.
    pub fn max_receive_count(&self) -> u32 {
        self.settings.max_receive_count.max(1)
    }

    /// Clear the queue, then wait out the purge cooldown.
    pub async fn purge(&self) -> PipelineResult<()> {
        let mut retried = false;
        loop {
            match self.backend.purge().await? {
                PurgeStatus::Purged(removed) => {
                    tracing::info!("{}: purged {} message(s)", self.label, removed);
                    tokio::time::sleep(self.settings.purge_cooldown()).await;
                    return Ok(());
                }
                PurgeStatus::Busy(wait) if !retried => {
                    tracing::warn!("{}: purge in progress, retrying in {:?}", self.label, wait);
                    tokio::time::sleep(wait).await;
                    retried = true;
                }
                PurgeStatus::Busy(wait) => {
                    return Err(anyhow::anyhow!(
                        "{}: purge still in progress, retry in {:?}",
                        self.label,
                        wait
                    )
                    .into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_is_offset_total_query() {
        assert_eq!(message_id(3, 11, "q-1", 80), "000003-000011_q-1");
    }

    #[test]
    fn message_id_is_truncated_below_limit() {
        let query_id = "x".repeat(100);
        let id = message_id(0, 1, &query_id, 80);
        assert_eq!(id.chars().count(), 79);
        assert!(id.starts_with("000000-000001_x"));
    }

    #[test]
    fn length_mode_picks_counts() {
        let attrs = QueueAttributes {
            visible: 4,
            in_flight: 2,
            delayed: 1,
        };
        assert_eq!(LengthMode::Visible.pick(&attrs), 4);
        assert_eq!(LengthMode::InFlight.pick(&attrs), 2);
        assert_eq!(LengthMode::Delayed.pick(&attrs), 1);
        assert_eq!(LengthMode::Total.pick(&attrs), 7);
        assert_eq!(LengthMode::InFlight.to_string(), "inflight");
    }
}
