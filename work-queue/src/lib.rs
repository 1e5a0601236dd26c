pub mod error;
pub mod message;
pub mod queue;

pub use error::{QueueError, Result};
pub use message::{
    BatchFailure, BatchOutcome, DeleteEntry, OutgoingMessage, QueueAttributes, QueueKind,
    ReceivedMessage, SendOutcome, SentMessage,
};
pub use queue::{DurableQueue, QueueOptions, EXPIRED_RECEIPT, MAX_BATCH_SIZE};
