//! Manual Commit Gate - Explicit, caller-driven offset commits
//!
//! The pipeline issues one [`CommitHandle`] per delivered record. The handle
//! only commits while its record sits between "processing returned" and
//! "pipeline moved on". Committing the same handle twice is harmless.
//!
//! ```text
//! issue()          process() -> Ok        on_processed() returns
//!   │ InFlight ───────────► Completed ───────────► Retired
//!   │  commit: InvalidCommitOrder                    commit: CommitRejected
//!   │                        commit: flush + ledger
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::client::BrokerClient;
use crate::error::{ConsumerError, StaleReason};
use crate::ledger::OffsetLedger;
use crate::metrics_consts::COMMITS;
use crate::types::{Partition, Record};

const PHASE_IN_FLIGHT: u8 = 0;
const PHASE_COMPLETED: u8 = 1;
const PHASE_RETIRED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlePhase {
    /// The processing call for the record has not returned yet
    InFlight,
    /// Processing succeeded; the handle may commit
    Completed,
    /// The pipeline moved past the record
    Retired,
}

impl HandlePhase {
    fn from_u8(value: u8) -> Self {
        match value {
            PHASE_IN_FLIGHT => HandlePhase::InFlight,
            PHASE_COMPLETED => HandlePhase::Completed,
            _ => HandlePhase::Retired,
        }
    }
}

#[derive(Clone)]
pub struct CommitGate {
    ledger: Arc<OffsetLedger>,
    broker: Arc<dyn BrokerClient>,
}

impl CommitGate {
    pub fn new(ledger: Arc<OffsetLedger>, broker: Arc<dyn BrokerClient>) -> Self {
        Self { ledger, broker }
    }

    /// Bind a handle to `record` and the partition's current assignment.
    ///
    /// The returned [`HandleLifecycle`] stays with the pipeline, which uses it
    /// to move the handle through its phases.
    pub fn issue(&self, record: &Record) -> Result<(CommitHandle, HandleLifecycle), ConsumerError> {
        let generation = self
            .ledger
            .generation(record.partition())
            .ok_or_else(|| ConsumerError::UnknownPartition(record.partition().clone()))?;

        let phase = Arc::new(AtomicU8::new(PHASE_IN_FLIGHT));
        let misused = Arc::new(AtomicBool::new(false));
        let handle = CommitHandle {
            partition: record.partition().clone(),
            offset: record.offset(),
            generation,
            phase: phase.clone(),
            misused: misused.clone(),
            gate: self.clone(),
        };

        Ok((handle, HandleLifecycle { phase, misused }))
    }

    async fn commit_sync(&self, handle: &CommitHandle) -> Result<(), ConsumerError> {
        let partition = &handle.partition;
        let offset = handle.offset;

        match handle.phase() {
            HandlePhase::InFlight => {
                handle.misused.store(true, Ordering::SeqCst);
                metrics::counter!(COMMITS, "outcome" => "invalid_order").increment(1);
                return Err(ConsumerError::InvalidCommitOrder {
                    partition: partition.clone(),
                    offset,
                });
            }
            HandlePhase::Retired => {
                return Err(Self::reject(partition, offset, StaleReason::SupersededByLaterOffset));
            }
            HandlePhase::Completed => {}
        }

        let cursor = match self.ledger.cursor(partition) {
            Ok(cursor) => cursor,
            Err(_) => return Err(Self::reject(partition, offset, StaleReason::PartitionRevoked)),
        };
        if cursor.generation != handle.generation {
            return Err(Self::reject(partition, offset, StaleReason::PartitionRevoked));
        }
        if cursor.next_offset_to_deliver != offset + 1 {
            return Err(Self::reject(partition, offset, StaleReason::SupersededByLaterOffset));
        }

        if let Err(e) = self.broker.flush_commit(partition, offset).await {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = offset,
                error = ?e,
                "Broker rejected offset commit"
            );
            metrics::counter!(COMMITS, "outcome" => "broker_error").increment(1);
            return Err(ConsumerError::Broker(e));
        }

        // A revoke may have landed while the flush was in progress
        if self.ledger.generation(partition) != Some(handle.generation) {
            return Err(Self::reject(partition, offset, StaleReason::PartitionRevoked));
        }
        match self.ledger.commit(partition, offset) {
            Ok(_) => {}
            Err(ConsumerError::UnknownPartition(_)) => {
                return Err(Self::reject(partition, offset, StaleReason::PartitionRevoked));
            }
            Err(e) => return Err(e),
        }

        debug!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            offset = offset,
            "Committed offset"
        );
        metrics::counter!(COMMITS, "outcome" => "committed").increment(1);
        Ok(())
    }

    fn reject(partition: &Partition, offset: i64, reason: StaleReason) -> ConsumerError {
        warn!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            offset = offset,
            reason = %reason,
            "Rejecting stale commit"
        );
        metrics::counter!(COMMITS, "outcome" => "rejected").increment(1);
        ConsumerError::CommitRejected {
            partition: partition.clone(),
            offset,
            reason,
        }
    }
}

/// Capability to commit one delivered record
pub struct CommitHandle {
    partition: Partition,
    offset: i64,
    generation: u64,
    phase: Arc<AtomicU8>,
    misused: Arc<AtomicBool>,
    gate: CommitGate,
}

impl CommitHandle {
    /// Commit this record's offset and wait until the broker and the ledger
    /// both recorded it.
    pub async fn commit_sync(&self) -> Result<(), ConsumerError> {
        self.gate.commit_sync(self).await
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn phase(&self) -> HandlePhase {
        HandlePhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn is_committable(&self) -> bool {
        self.phase() == HandlePhase::Completed
    }
}

impl fmt::Debug for CommitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitHandle")
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("generation", &self.generation)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Pipeline-side control over a handle's phase
pub struct HandleLifecycle {
    phase: Arc<AtomicU8>,
    misused: Arc<AtomicBool>,
}

impl HandleLifecycle {
    pub fn complete(&self) {
        let _ = self.phase.compare_exchange(
            PHASE_IN_FLIGHT,
            PHASE_COMPLETED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn retire(&self) {
        self.phase.store(PHASE_RETIRED, Ordering::SeqCst);
    }

    /// Whether the processor tried to commit before its processing call
    /// returned. Checked by the pipeline so the error cannot be swallowed.
    pub fn commit_attempted_in_flight(&self) -> bool {
        self.misused.load(Ordering::SeqCst)
    }
}
