use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

/// Delivery semantics of a queue.
///
/// `Fifo` queues require a group key on every message and never hand out a
/// message while another message of the same group is in flight. `Standard`
/// queues deliver any visible message to any consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Fifo,
    Standard,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Fifo => "fifo",
            QueueKind::Standard => "standard",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "fifo" => Ok(QueueKind::Fifo),
            "standard" => Ok(QueueKind::Standard),
            other => Err(QueueError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Caller-chosen id, unique within one batch.
    pub entry_id: String,
    pub body: String,
    pub group_key: Option<String>,
    pub delay: Option<Duration>,
}

impl OutgoingMessage {
    pub fn new(entry_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            body: body.into(),
            group_key: None,
            delay: None,
        }
    }

    pub fn with_group(mut self, group_key: impl Into<String>) -> Self {
        self.group_key = Some(group_key.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub entry_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub entry_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOutcome {
    pub successful: Vec<SentMessage>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub successful: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    /// Opaque token required to delete the message. Valid until the
    /// visibility timeout elapses.
    pub receipt_handle: String,
    pub body: String,
    pub group_key: Option<String>,
    pub sequence: i64,
    pub receive_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteEntry {
    pub entry_id: String,
    pub receipt_handle: String,
}

/// Point-in-time message counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueAttributes {
    pub visible: u64,
    pub in_flight: u64,
    pub delayed: u64,
}

impl QueueAttributes {
    pub fn total(&self) -> u64 {
        self.visible + self.in_flight + self.delayed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_kind_parses_round_names() {
        assert_eq!(QueueKind::parse("fifo").unwrap(), QueueKind::Fifo);
        assert_eq!(QueueKind::parse("standard").unwrap(), QueueKind::Standard);
        assert!(QueueKind::parse("priority").is_err());
    }

    #[test]
    fn attributes_total_sums_all_states() {
        let attrs = QueueAttributes {
            visible: 3,
            in_flight: 2,
            delayed: 1,
        };
        assert_eq!(attrs.total(), 6);
    }

    #[test]
    fn outgoing_builder_sets_group_and_delay() {
        let msg = OutgoingMessage::new("e1", "{}")
            .with_group("run-1")
            .with_delay(Duration::from_secs(5));
        assert_eq!(msg.group_key.as_deref(), Some("run-1"));
        assert_eq!(msg.delay, Some(Duration::from_secs(5)));
    }
}
