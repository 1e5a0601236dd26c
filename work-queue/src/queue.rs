use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::message::{
    BatchFailure, BatchOutcome, DeleteEntry, OutgoingMessage, QueueAttributes, QueueKind,
    ReceivedMessage, SendOutcome, SentMessage,
};

/// Maximum number of entries accepted by a single batch request.
pub const MAX_BATCH_SIZE: usize = 10;

/// Failure reason reported when a delete uses a handle whose visibility
/// timeout has already elapsed.
pub const EXPIRED_RECEIPT: &str = "The receipt handle has expired";

const INVALID_RECEIPT: &str = "The receipt handle is not valid";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id     TEXT NOT NULL UNIQUE,
    group_key      TEXT,
    body           TEXT NOT NULL,
    visible_at     INTEGER NOT NULL,
    receipt        TEXT,
    receive_count  INTEGER NOT NULL DEFAULT 0,
    created_at     INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_visible ON messages (visible_at, seq);
CREATE INDEX IF NOT EXISTS idx_messages_receipt ON messages (receipt);

CREATE TABLE IF NOT EXISTS purges (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    purged_at   INTEGER NOT NULL
);
"#;

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub kind: QueueKind,
    /// How long a received message stays hidden before it is redelivered.
    pub visibility_timeout: Duration,
    /// Minimum spacing between two purges.
    pub purge_interval: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            kind: QueueKind::Fifo,
            visibility_timeout: Duration::from_secs(30),
            purge_interval: Duration::from_secs(60),
        }
    }
}

/// A durable queue stored in a single SQLite file.
///
/// Messages are never handed to two consumers at once: receiving a message
/// stamps it with a fresh receipt handle and hides it for the visibility
/// timeout. Deleting requires the live handle. A handle whose timeout elapsed
/// is rejected, because the message may already have been redelivered.
pub struct DurableQueue {
    path: PathBuf,
    options: QueueOptions,
    conn: Mutex<Connection>,
}

impl DurableQueue {
    pub fn open(path: impl AsRef<Path>, options: QueueOptions) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
                #[cfg(unix)]
                set_owner_perms(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "normal").ok();
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path: path.to_path_buf(),
            options,
            conn: Mutex::new(conn),
        })
    }

    pub fn kind(&self) -> QueueKind {
        self.options.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store up to [`MAX_BATCH_SIZE`] messages in one transaction.
    ///
    /// Entries that violate the queue kind (missing group key on a FIFO
    /// queue, group key on a standard queue) are reported as failed while the
    /// rest of the batch is stored.
    pub fn send_batch(&self, entries: &[OutgoingMessage]) -> Result<SendOutcome> {
        check_batch(entries.iter().map(|e| e.entry_id.as_str()))?;

        let now = now_millis();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut outcome = SendOutcome::default();

        for entry in entries {
            if let Some(reason) = self.reject_reason(entry) {
                outcome.failed.push(BatchFailure {
                    entry_id: entry.entry_id.clone(),
                    reason: reason.to_string(),
                });
                continue;
            }
            let message_id = Uuid::new_v4().to_string();
            let visible_at = now.saturating_add(entry.delay.map(duration_millis).unwrap_or(0));
            tx.execute(
                "INSERT INTO messages(message_id, group_key, body, visible_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![message_id, entry.group_key, entry.body, visible_at, now],
            )?;
            outcome.successful.push(SentMessage {
                entry_id: entry.entry_id.clone(),
                message_id,
            });
        }

        tx.commit()?;
        Ok(outcome)
    }

    fn reject_reason(&self, entry: &OutgoingMessage) -> Option<&'static str> {
        match (self.options.kind, entry.group_key.is_some()) {
            (QueueKind::Fifo, false) => Some("a group key is required on a fifo queue"),
            (QueueKind::Standard, true) => Some("group keys are only valid on a fifo queue"),
            _ => None,
        }
    }

    /// Receive up to `max` visible messages, hiding each for the visibility
    /// timeout.
    ///
    /// On a FIFO queue a group with any message in flight is skipped entirely,
    /// and a message is only eligible once every earlier message of its group
    /// is visible.
    pub fn receive(&self, max: usize) -> Result<Vec<ReceivedMessage>> {
        let max = max.clamp(1, MAX_BATCH_SIZE);
        let now = now_millis();
        let hidden_until = now.saturating_add(duration_millis(self.options.visibility_timeout));

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let query = match self.options.kind {
            QueueKind::Fifo => {
                "SELECT m.seq, m.message_id, m.group_key, m.body, m.receive_count
                 FROM messages m
                 WHERE m.visible_at <= ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM messages f
                       WHERE f.group_key = m.group_key
                         AND f.receipt IS NOT NULL
                         AND f.visible_at > ?1)
                   AND NOT EXISTS (
                       SELECT 1 FROM messages d
                       WHERE d.group_key = m.group_key
                         AND d.seq < m.seq
                         AND d.visible_at > ?1)
                 ORDER BY m.seq ASC
                 LIMIT ?2"
            }
            QueueKind::Standard => {
                "SELECT m.seq, m.message_id, m.group_key, m.body, m.receive_count
                 FROM messages m
                 WHERE m.visible_at <= ?1
                 ORDER BY m.seq ASC
                 LIMIT ?2"
            }
        };

        let mut picked = Vec::new();
        {
            let mut stmt = tx.prepare(query)?;
            let mut rows = stmt.query(params![now, max as i64])?;
            while let Some(row) = rows.next()? {
                let receive_count: i64 = row.get(4)?;
                picked.push(ReceivedMessage {
                    sequence: row.get(0)?,
                    message_id: row.get(1)?,
                    group_key: row.get(2)?,
                    body: row.get(3)?,
                    receive_count: (receive_count + 1) as u32,
                    receipt_handle: Uuid::new_v4().to_string(),
                });
            }
        }

        for msg in &picked {
            tx.execute(
                "UPDATE messages
                 SET receipt = ?1, visible_at = ?2, receive_count = receive_count + 1
                 WHERE seq = ?3",
                params![msg.receipt_handle, hidden_until, msg.sequence],
            )?;
        }

        tx.commit()?;
        Ok(picked)
    }

    /// Delete messages by receipt handle.
    ///
    /// A handle is only honoured while its message is still hidden. Once the
    /// visibility timeout elapses the entry fails with [`EXPIRED_RECEIPT`].
    pub fn delete_batch(&self, entries: &[DeleteEntry]) -> Result<BatchOutcome> {
        check_batch(entries.iter().map(|e| e.entry_id.as_str()))?;

        let now = now_millis();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut outcome = BatchOutcome::default();

        for entry in entries {
            let deleted = tx.execute(
                "DELETE FROM messages WHERE receipt = ?1 AND visible_at > ?2",
                params![entry.receipt_handle, now],
            )?;
            if deleted == 1 {
                outcome.successful.push(entry.entry_id.clone());
                continue;
            }
            let known: Option<i64> = tx
                .query_row(
                    "SELECT seq FROM messages WHERE receipt = ?1",
                    [&entry.receipt_handle],
                    |row| row.get(0),
                )
                .optional()?;
            let reason = if known.is_some() {
                EXPIRED_RECEIPT
            } else {
                INVALID_RECEIPT
            };
            outcome.failed.push(BatchFailure {
                entry_id: entry.entry_id.clone(),
                reason: reason.to_string(),
            });
        }

        tx.commit()?;
        Ok(outcome)
    }

    /// Make an in-flight message visible again after `timeout`.
    ///
    /// Returns `false` when the handle is unknown or already expired.
    pub fn change_visibility(&self, receipt_handle: &str, timeout: Duration) -> Result<bool> {
        let now = now_millis();
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE messages SET visible_at = ?1 WHERE receipt = ?2 AND visible_at > ?3",
            params![now.saturating_add(duration_millis(timeout)), receipt_handle, now],
        )?;
        Ok(updated == 1)
    }

    pub fn attributes(&self) -> Result<QueueAttributes> {
        let now = now_millis();
        let conn = self.lock()?;
        let (visible, in_flight, delayed) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN visible_at <= ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN visible_at > ?1 AND receipt IS NOT NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN visible_at > ?1 AND receipt IS NULL THEN 1 ELSE 0 END), 0)
             FROM messages",
            [now],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )?;
        Ok(QueueAttributes {
            visible: visible as u64,
            in_flight: in_flight as u64,
            delayed: delayed as u64,
        })
    }

    /// Remove every message. A second purge inside the purge interval fails
    /// with [`QueueError::PurgeInProgress`].
    pub fn purge(&self) -> Result<u64> {
        let now = now_millis();
        let interval = duration_millis(self.options.purge_interval);
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let last: Option<i64> = tx
            .query_row("SELECT purged_at FROM purges WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        if let Some(last) = last {
            let elapsed = now - last;
            if elapsed < interval {
                return Err(QueueError::PurgeInProgress {
                    retry_after: Duration::from_millis((interval - elapsed) as u64),
                });
            }
        }

        let removed = tx.execute("DELETE FROM messages", [])?;
        tx.execute(
            "INSERT INTO purges(id, purged_at) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET purged_at = excluded.purged_at",
            [now],
        )?;
        tx.commit()?;
        Ok(removed as u64)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| QueueError::LockPoisoned)
    }
}

fn check_batch<'a>(ids: impl ExactSizeIterator<Item = &'a str>) -> Result<()> {
    let len = ids.len();
    if len == 0 {
        return Err(QueueError::EmptyBatch);
    }
    if len > MAX_BATCH_SIZE {
        return Err(QueueError::BatchTooLarge {
            len,
            max: MAX_BATCH_SIZE,
        });
    }
    let mut seen = HashSet::with_capacity(len);
    for id in ids {
        if !seen.insert(id) {
            return Err(QueueError::DuplicateEntryId(id.to_string()));
        }
    }
    Ok(())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(unix)]
fn set_owner_perms(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = fs::metadata(path)?;
    let mut perms = metadata.permissions();
    perms.set_mode(0o700);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_batch_rejects_empty_and_oversized() {
        assert!(matches!(
            check_batch(Vec::<&str>::new().into_iter()),
            Err(QueueError::EmptyBatch)
        ));
        let ids: Vec<String> = (0..11).map(|i| format!("e{i}")).collect();
        assert!(matches!(
            check_batch(ids.iter().map(String::as_str)),
            Err(QueueError::BatchTooLarge { len: 11, max: 10 })
        ));
    }

    #[test]
    fn check_batch_rejects_duplicate_ids() {
        let err = check_batch(["a", "b", "a"].into_iter()).unwrap_err();
        assert!(matches!(err, QueueError::DuplicateEntryId(id) if id == "a"));
    }

    #[test]
    fn duration_millis_saturates() {
        assert_eq!(duration_millis(Duration::from_millis(250)), 250);
        assert_eq!(duration_millis(Duration::MAX), i64::MAX);
    }
}
