// ABOUTME: Typed error taxonomy for the delta dispatch pipeline
// ABOUTME: Separates always-fatal queue protocol violations from per-item and collaborator failures

use thiserror::Error;

/// Errors raised by pipeline stages.
///
/// Per-item send failures are not errors; they are reported as
/// [`SubmitOutcome`](crate::submit::SubmitOutcome) values and written to the
/// error sink. Everything here aborts the current stage invocation.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("query {query_id} did not succeed: {reason}")]
    QueryExecution { query_id: String, reason: String },

    #[error("queue accepted {sent} of {expected} messages in one chunk: {failures}")]
    PartialSend {
        sent: usize,
        expected: usize,
        failures: String,
    },

    #[error("messages still in flight after {attempts} checks ({in_flight} outstanding)")]
    StuckInFlight { attempts: u32, in_flight: u64 },

    #[error("queue is empty")]
    EmptyQueue,

    #[error("failed to delete {failed} message(s): {reasons}")]
    Ack { failed: usize, reasons: String },

    #[error("{what} mismatch: expected {expected}, found {found}")]
    CountMismatch {
        what: &'static str,
        expected: u64,
        found: u64,
    },

    /// A failure that is already in the error sink. Propagates to the FAIL
    /// stage without being written again.
    #[error("error in {group}: {cause}. logged in error sink")]
    Halted { group: String, cause: String },

    #[error("lookup of {item} failed: {reason}")]
    Lookup { item: String, reason: String },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl PipelineError {
    /// Queue state no longer matches the pipeline's assumptions. These are
    /// never retried.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            PipelineError::PartialSend { .. }
                | PipelineError::StuckInFlight { .. }
                | PipelineError::EmptyQueue
                | PipelineError::Ack { .. }
                | PipelineError::CountMismatch { .. }
        )
    }

    /// True when the cause has already been durably recorded.
    pub fn is_recorded(&self) -> bool {
        matches!(self, PipelineError::Halted { .. })
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_violations_are_classified() {
        assert!(PipelineError::EmptyQueue.is_protocol_violation());
        assert!(PipelineError::StuckInFlight {
            attempts: 6,
            in_flight: 3
        }
        .is_protocol_violation());
        assert!(PipelineError::CountMismatch {
            what: "queue length",
            expected: 11,
            found: 10
        }
        .is_protocol_violation());
        assert!(!PipelineError::Lookup {
            item: "S1".into(),
            reason: "timeout".into()
        }
        .is_protocol_violation());
    }

    #[test]
    fn halted_is_recorded_and_mentions_sink() {
        let err = PipelineError::Halted {
            group: "site".into(),
            cause: "Missing postal_code for Site: S1".into(),
        };
        assert!(err.is_recorded());
        assert!(err.to_string().contains("logged in error sink"));
    }

    #[test]
    fn backend_wraps_anyhow_transparently() {
        let err: PipelineError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.to_string(), "disk full");
        assert!(!err.is_recorded());
    }
}
