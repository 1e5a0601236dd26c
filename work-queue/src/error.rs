use std::time::Duration;

/// Errors produced by [`DurableQueue`](crate::DurableQueue) operations.
///
/// Per-entry problems inside a batch are not errors; they are reported in the
/// `failed` list of the batch outcome. These variants reject a whole request.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("queue lock poisoned")]
    LockPoisoned,

    #[error("batch must contain at least one entry")]
    EmptyBatch,

    #[error("batch of {len} entries exceeds the maximum of {max}")]
    BatchTooLarge { len: usize, max: usize },

    #[error("duplicate entry id in batch: {0}")]
    DuplicateEntryId(String),

    #[error("a purge is already in progress, retry in {retry_after:?}")]
    PurgeInProgress { retry_after: Duration },

    #[error("unknown queue kind: {0}")]
    UnknownKind(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_too_large_mentions_limit() {
        let err = QueueError::BatchTooLarge { len: 11, max: 10 };
        assert_eq!(
            err.to_string(),
            "batch of 11 entries exceeds the maximum of 10"
        );
    }

    #[test]
    fn purge_in_progress_displays_retry() {
        let err = QueueError::PurgeInProgress {
            retry_after: Duration::from_secs(3),
        };
        assert!(err.to_string().contains("3s"));
    }
}
