//! Offset Ledger - Tracks per-partition delivery and commit positions
//!
//! Each assigned partition owns a [`PartitionCursor`]. The cursor records the
//! next offset the pipeline is allowed to deliver and the last offset that was
//! durably committed. Every method touches a single partition's entry, so
//! workers owning different partitions never contend on a shared lock.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::error::ConsumerError;
use crate::metrics_consts::{LEDGER_SEQUENCE_VIOLATIONS, PARTITION_LAST_COMMITTED_OFFSET};
use crate::types::Partition;

/// Snapshot of one partition's position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionCursor {
    /// Offset of the next record the pipeline may deliver
    pub next_offset_to_deliver: i64,
    /// Offset of the last committed record, -1 when nothing was committed yet
    pub last_committed_offset: i64,
    /// While set, no record of the partition is delivered
    pub halted: bool,
    /// Unique per assignment; changes when a partition is revoked and re-assigned
    pub generation: u64,
}

impl PartitionCursor {
    fn new(next_offset: i64, generation: u64) -> Self {
        Self {
            next_offset_to_deliver: next_offset,
            last_committed_offset: next_offset - 1,
            halted: false,
            generation,
        }
    }

    pub fn resume_offset(&self) -> i64 {
        self.last_committed_offset + 1
    }
}

pub struct OffsetLedger {
    cursors: DashMap<Partition, PartitionCursor>,
    // Start at 1 so 0 never matches a live cursor
    next_generation: AtomicU64,
}

impl Default for OffsetLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetLedger {
    pub fn new() -> Self {
        Self {
            cursors: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Create the cursor for a newly assigned partition.
    ///
    /// `next_offset` is where consumption starts, usually the group's committed
    /// position. Assigning a partition that already has a cursor replaces it
    /// with a fresh generation, which invalidates every outstanding commit handle.
    pub fn assign(&self, partition: &Partition, next_offset: i64) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let previous = self
            .cursors
            .insert(partition.clone(), PartitionCursor::new(next_offset, generation));

        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            next_offset = next_offset,
            generation = generation,
            replaced = previous.is_some(),
            "Partition cursor created"
        );
        generation
    }

    /// Drop the cursor of a revoked partition
    pub fn revoke(&self, partition: &Partition) -> Option<PartitionCursor> {
        let removed = self.cursors.remove(partition).map(|(_, cursor)| cursor);
        if let Some(cursor) = &removed {
            info!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                next_offset = cursor.next_offset_to_deliver,
                last_committed = cursor.last_committed_offset,
                "Partition cursor removed"
            );
        }
        removed
    }

    /// Drop every cursor (during shutdown)
    pub fn clear_all(&self) {
        self.cursors.clear();
    }

    /// Verify that `offset` is exactly the next record this partition expects.
    ///
    /// Anything else means the fetcher or the pipeline broke ordering, which
    /// would otherwise silently skip or duplicate records.
    pub fn record_delivered(&self, partition: &Partition, offset: i64) -> Result<(), ConsumerError> {
        let cursor = self.cursor(partition)?;
        Self::check_sequence(partition, &cursor, offset)
    }

    /// Advance past a record whose processing call returned successfully
    pub fn record_processed(&self, partition: &Partition, offset: i64) -> Result<(), ConsumerError> {
        let mut entry = self
            .cursors
            .get_mut(partition)
            .ok_or_else(|| ConsumerError::UnknownPartition(partition.clone()))?;

        Self::check_sequence(partition, &entry, offset)?;
        entry.next_offset_to_deliver = offset + 1;
        Ok(())
    }

    fn check_sequence(
        partition: &Partition,
        cursor: &PartitionCursor,
        offset: i64,
    ) -> Result<(), ConsumerError> {
        if offset == cursor.next_offset_to_deliver {
            return Ok(());
        }

        error!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            expected = cursor.next_offset_to_deliver,
            actual = offset,
            "Record delivered out of sequence"
        );
        metrics::counter!(
            LEDGER_SEQUENCE_VIOLATIONS,
            "topic" => partition.topic().to_string(),
            "partition" => partition.partition_number().to_string()
        )
        .increment(1);

        Err(ConsumerError::SequenceViolation {
            partition: partition.clone(),
            expected: cursor.next_offset_to_deliver,
            actual: offset,
        })
    }

    /// Record a durable commit.
    ///
    /// Commits only move forward: an offset below the current commit is
    /// ignored and `false` is returned. Re-committing the current offset is
    /// accepted. An offset that has not been processed yet is rejected, so
    /// the commit always stays behind `next_offset_to_deliver`.
    pub fn commit(&self, partition: &Partition, offset: i64) -> Result<bool, ConsumerError> {
        let mut entry = self
            .cursors
            .get_mut(partition)
            .ok_or_else(|| ConsumerError::UnknownPartition(partition.clone()))?;

        if offset >= entry.next_offset_to_deliver {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = offset,
                next_offset = entry.next_offset_to_deliver,
                "Rejecting commit of an offset that was not processed"
            );
            return Err(ConsumerError::InvalidCommitOrder {
                partition: partition.clone(),
                offset,
            });
        }

        if offset < entry.last_committed_offset {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = offset,
                last_committed = entry.last_committed_offset,
                "Ignoring commit below the committed offset"
            );
            return Ok(false);
        }

        entry.last_committed_offset = offset;
        metrics::gauge!(
            PARTITION_LAST_COMMITTED_OFFSET,
            "topic" => partition.topic().to_string(),
            "partition" => partition.partition_number().to_string()
        )
        .set(offset as f64);
        Ok(true)
    }

    /// Offset consumption must resume from after a halt or a restart
    pub fn resume_offset(&self, partition: &Partition) -> Option<i64> {
        self.cursors.get(partition).map(|c| c.resume_offset())
    }

    /// Move delivery back to the resume offset. Records that were processed
    /// but never committed are delivered again.
    pub fn rewind(&self, partition: &Partition) -> Option<i64> {
        let mut entry = self.cursors.get_mut(partition)?;
        let resume = entry.resume_offset();
        if entry.next_offset_to_deliver != resume {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                from = entry.next_offset_to_deliver,
                to = resume,
                "Rewinding uncommitted records"
            );
        }
        entry.next_offset_to_deliver = resume;
        Some(resume)
    }

    pub fn set_halted(&self, partition: &Partition, halted: bool) -> Result<(), ConsumerError> {
        let mut entry = self
            .cursors
            .get_mut(partition)
            .ok_or_else(|| ConsumerError::UnknownPartition(partition.clone()))?;
        entry.halted = halted;
        Ok(())
    }

    /// Unassigned partitions count as halted: nothing may be delivered for them
    pub fn is_halted(&self, partition: &Partition) -> bool {
        self.cursors.get(partition).map_or(true, |c| c.halted)
    }

    pub fn cursor(&self, partition: &Partition) -> Result<PartitionCursor, ConsumerError> {
        self.cursors
            .get(partition)
            .map(|c| *c)
            .ok_or_else(|| ConsumerError::UnknownPartition(partition.clone()))
    }

    pub fn generation(&self, partition: &Partition) -> Option<u64> {
        self.cursors.get(partition).map(|c| c.generation)
    }

    pub fn partitions(&self) -> Vec<Partition> {
        self.cursors.iter().map(|e| e.key().clone()).collect()
    }

    pub fn partition_count(&self) -> usize {
        self.cursors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_partition(num: i32) -> Partition {
        Partition::new("test-topic", num)
    }

    #[test]
    fn test_assign_initializes_cursor() {
        let ledger = OffsetLedger::new();
        let partition = test_partition(0);

        ledger.assign(&partition, 0);

        let cursor = ledger.cursor(&partition).unwrap();
        assert_eq!(cursor.next_offset_to_deliver, 0);
        assert_eq!(cursor.last_committed_offset, -1);
        assert!(!cursor.halted);
        assert_eq!(ledger.resume_offset(&partition), Some(0));
    }

    #[test]
    fn test_assign_from_committed_position() {
        let ledger = OffsetLedger::new();
        let partition = test_partition(0);

        ledger.assign(&partition, 100);

        let cursor = ledger.cursor(&partition).unwrap();
        assert_eq!(cursor.last_committed_offset, 99);
        assert_eq!(ledger.resume_offset(&partition), Some(100));
    }

    #[test]
    fn test_generations_are_unique() {
        let ledger = OffsetLedger::new();
        let partition = test_partition(0);

        let g1 = ledger.assign(&partition, 0);
        ledger.revoke(&partition);
        let g2 = ledger.assign(&partition, 0);
        let g3 = ledger.assign(&test_partition(1), 0);

        assert_ne!(g1, g2);
        assert_ne!(g2, g3);
        assert_eq!(ledger.generation(&partition), Some(g2));
    }

    #[test]
    fn test_record_delivered_enforces_sequence() {
        let ledger = OffsetLedger::new();
        let partition = test_partition(0);
        ledger.assign(&partition, 5);

        assert!(ledger.record_delivered(&partition, 5).is_ok());

        let err = ledger.record_delivered(&partition, 6).unwrap_err();
        assert!(matches!(
            err,
            ConsumerError::SequenceViolation {
                expected: 5,
                actual: 6,
                ..
            }
        ));

        let err = ledger.record_delivered(&partition, 4).unwrap_err();
        assert!(matches!(err, ConsumerError::SequenceViolation { .. }));
    }

    #[test]
    fn test_record_processed_advances_next_offset() {
        let ledger = OffsetLedger::new();
        let partition = test_partition(0);
        ledger.assign(&partition, 0);

        ledger.record_processed(&partition, 0).unwrap();
        ledger.record_processed(&partition, 1).unwrap();

        assert_eq!(ledger.cursor(&partition).unwrap().next_offset_to_deliver, 2);
        assert!(ledger.record_delivered(&partition, 2).is_ok());
        assert!(ledger.record_processed(&partition, 5).is_err());
    }

    #[test]
    fn test_unknown_partition() {
        let ledger = OffsetLedger::new();
        let partition = test_partition(7);

        assert!(matches!(
            ledger.record_delivered(&partition, 0),
            Err(ConsumerError::UnknownPartition(_))
        ));
        assert!(matches!(
            ledger.commit(&partition, 0),
            Err(ConsumerError::UnknownPartition(_))
        ));
        assert_eq!(ledger.resume_offset(&partition), None);
        assert!(ledger.is_halted(&partition));
    }

    #[test]
    fn test_commit_is_monotonic() {
        let ledger = OffsetLedger::new();
        let partition = test_partition(0);
        ledger.assign(&partition, 0);
        for offset in 0..4 {
            ledger.record_processed(&partition, offset).unwrap();
        }

        assert!(ledger.commit(&partition, 3).unwrap());
        assert!(!ledger.commit(&partition, 1).unwrap()); // late commit ignored
        assert!(ledger.commit(&partition, 3).unwrap()); // duplicate tolerated

        assert_eq!(ledger.cursor(&partition).unwrap().last_committed_offset, 3);
        assert_eq!(ledger.resume_offset(&partition), Some(4));
    }

    #[test]
    fn test_commit_past_processed_offsets_is_rejected() {
        let ledger = OffsetLedger::new();
        let partition = test_partition(0);
        ledger.assign(&partition, 0);
        ledger.record_processed(&partition, 0).unwrap();

        assert!(matches!(
            ledger.commit(&partition, 3),
            Err(ConsumerError::InvalidCommitOrder { offset: 3, .. })
        ));
        assert!(ledger.commit(&partition, 1).is_err());

        // nothing moved, so a rewind cannot skip undelivered records
        let cursor = ledger.cursor(&partition).unwrap();
        assert_eq!(cursor.last_committed_offset, -1);
        assert_eq!(ledger.rewind(&partition), Some(0));
    }

    #[test]
    fn test_rewind_returns_to_first_uncommitted_offset() {
        let ledger = OffsetLedger::new();
        let partition = test_partition(0);
        ledger.assign(&partition, 0);

        for offset in 0..4 {
            ledger.record_processed(&partition, offset).unwrap();
        }
        ledger.commit(&partition, 1).unwrap();

        assert_eq!(ledger.rewind(&partition), Some(2));
        let cursor = ledger.cursor(&partition).unwrap();
        assert_eq!(cursor.next_offset_to_deliver, 2);
        assert_eq!(cursor.last_committed_offset, 1);
    }

    #[test]
    fn test_halt_flag() {
        let ledger = OffsetLedger::new();
        let partition = test_partition(0);
        ledger.assign(&partition, 0);

        assert!(!ledger.is_halted(&partition));
        ledger.set_halted(&partition, true).unwrap();
        assert!(ledger.is_halted(&partition));
        ledger.set_halted(&partition, false).unwrap();
        assert!(!ledger.is_halted(&partition));
    }

    #[test]
    fn test_revoke_and_clear_all() {
        let ledger = OffsetLedger::new();
        ledger.assign(&test_partition(0), 0);
        ledger.assign(&test_partition(1), 0);
        ledger.assign(&test_partition(2), 0);

        assert!(ledger.revoke(&test_partition(0)).is_some());
        assert!(ledger.revoke(&test_partition(0)).is_none());
        assert_eq!(ledger.partition_count(), 2);
        assert_eq!(ledger.generation(&test_partition(0)), None);

        ledger.clear_all();
        assert_eq!(ledger.partition_count(), 0);
    }

    #[test]
    fn test_concurrent_commits_never_regress() {
        use std::sync::Arc;
        use std::thread;

        let ledger = Arc::new(OffsetLedger::new());
        let partition = test_partition(0);
        ledger.assign(&partition, 0);
        for offset in 0..=90 {
            ledger.record_processed(&partition, offset).unwrap();
        }

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let ledger = ledger.clone();
                let partition = partition.clone();
                thread::spawn(move || {
                    ledger.commit(&partition, i * 10).unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ledger.cursor(&partition).unwrap().last_committed_offset, 90);
    }

    #[test]
    fn test_concurrent_different_partitions() {
        use std::sync::Arc;
        use std::thread;

        let ledger = Arc::new(OffsetLedger::new());
        for i in 0..10 {
            ledger.assign(&test_partition(i), 0);
        }

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let ledger = ledger.clone();
                thread::spawn(move || {
                    let partition = test_partition(i);
                    for offset in 0..=(i as i64) {
                        ledger.record_processed(&partition, offset).unwrap();
                        ledger.commit(&partition, offset).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        for i in 0..10 {
            let cursor = ledger.cursor(&test_partition(i)).unwrap();
            assert_eq!(cursor.last_committed_offset, i as i64);
            assert_eq!(cursor.next_offset_to_deliver, i as i64 + 1);
        }
    }
}
