use std::fmt;

use thiserror::Error;

use crate::types::Partition;

/// Why a commit handle was no longer allowed to commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// The partition was revoked, or revoked and re-assigned, since the handle was issued
    PartitionRevoked,
    /// The pipeline already moved on to a later record of the partition
    SupersededByLaterOffset,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::PartitionRevoked => write!(f, "partition revoked"),
            StaleReason::SupersededByLaterOffset => write!(f, "a later offset was already delivered"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    /// The processing function returned an error; the record will be redelivered
    #[error("processing failed for {partition} at offset {offset}")]
    ProcessingFailure {
        partition: Partition,
        offset: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error("sequence violation on {partition}: expected offset {expected}, got {actual}")]
    SequenceViolation {
        partition: Partition,
        expected: i64,
        actual: i64,
    },

    #[error("commit rejected for {partition} at offset {offset}: {reason}")]
    CommitRejected {
        partition: Partition,
        offset: i64,
        reason: StaleReason,
    },

    #[error("commit for {partition} at offset {offset} issued before processing returned")]
    InvalidCommitOrder { partition: Partition, offset: i64 },

    #[error("partition {0} is not assigned to this consumer")]
    UnknownPartition(Partition),

    #[error("broker call failed")]
    Broker(#[source] anyhow::Error),

    #[error("partition worker for {0} stopped before replying")]
    WorkerGone(Partition),
}

impl ConsumerError {
    /// Fatal errors point at a defect in the pipeline, the fetcher or the
    /// processor and stop the consumer. Everything else is retried by halting
    /// the partition and redelivering.
    pub fn is_fatal(&self) -> bool {
        match self {
            ConsumerError::ProcessingFailure { .. }
            | ConsumerError::CommitRejected { .. }
            | ConsumerError::Broker(_) => false,
            ConsumerError::SequenceViolation { .. }
            | ConsumerError::InvalidCommitOrder { .. }
            | ConsumerError::UnknownPartition(_)
            | ConsumerError::WorkerGone(_) => true,
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ConsumerError::ProcessingFailure { .. } => "processing_failure",
            ConsumerError::SequenceViolation { .. } => "sequence_violation",
            ConsumerError::CommitRejected { .. } => "commit_rejected",
            ConsumerError::InvalidCommitOrder { .. } => "invalid_commit_order",
            ConsumerError::UnknownPartition(_) => "unknown_partition",
            ConsumerError::Broker(_) => "broker",
            ConsumerError::WorkerGone(_) => "worker_gone",
        }
    }
}
