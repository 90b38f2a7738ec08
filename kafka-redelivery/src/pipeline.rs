//! Delivery Pipeline - Hands one partition's records to the processor in order
//!
//! For every record of a partition's batch slice:
//! 1. skip the rest of the slice if the partition is halted
//! 2. check the record is exactly the next expected offset
//! 3. run the processor; on success advance the cursor and let the processor
//!    commit, on failure hand the record to the break-on-first-error
//!    controller and stop delivering this partition for the cycle

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error};

use crate::commit::CommitGate;
use crate::controller::BreakOnErrorController;
use crate::error::ConsumerError;
use crate::ledger::OffsetLedger;
use crate::metrics_consts::{RECORDS_DELIVERED, RECORDS_SKIPPED_HALTED, RECORD_PROCESSING_DURATION};
use crate::processor::RecordProcessor;
use crate::types::{Partition, Record};

/// What happened to one partition's slice of a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionOutcome {
    /// Records whose processing call returned successfully
    pub processed: usize,
    /// Records not delivered because the partition was halted
    pub skipped: usize,
    /// Offset of the record that halted the partition, if any
    pub failed_at: Option<i64>,
}

#[derive(Clone)]
pub struct DeliveryPipeline {
    ledger: Arc<OffsetLedger>,
    controller: Arc<BreakOnErrorController>,
    gate: CommitGate,
    processor: Arc<dyn RecordProcessor>,
}

impl DeliveryPipeline {
    pub fn new(
        ledger: Arc<OffsetLedger>,
        controller: Arc<BreakOnErrorController>,
        gate: CommitGate,
        processor: Arc<dyn RecordProcessor>,
    ) -> Self {
        Self {
            ledger,
            controller,
            gate,
            processor,
        }
    }

    /// Deliver `records` (ascending offsets of one partition) one at a time.
    ///
    /// Recoverable failures halt the partition and are reported through the
    /// outcome. Fatal errors are returned and stop the consumer.
    pub async fn deliver_partition(
        &self,
        partition: &Partition,
        records: Vec<Record>,
    ) -> Result<PartitionOutcome, ConsumerError> {
        let total = records.len();
        let mut outcome = PartitionOutcome::default();

        for (index, record) in records.into_iter().enumerate() {
            if self.ledger.is_halted(partition) {
                outcome.skipped = total - index;
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    first_skipped = record.offset(),
                    skipped = outcome.skipped,
                    "Partition halted - skipping remaining records of this batch"
                );
                metrics::counter!(
                    RECORDS_SKIPPED_HALTED,
                    "topic" => partition.topic().to_string(),
                    "partition" => partition.partition_number().to_string()
                )
                .increment(outcome.skipped as u64);
                break;
            }

            if self.deliver_record(&record).await? {
                outcome.processed += 1;
            } else {
                outcome.failed_at = Some(record.offset());
            }
        }

        Ok(outcome)
    }

    /// Returns `Ok(false)` when the record failed and the partition is now halted
    async fn deliver_record(&self, record: &Record) -> Result<bool, ConsumerError> {
        let partition = record.partition();
        let offset = record.offset();

        self.ledger.record_delivered(partition, offset)?;
        let (handle, lifecycle) = self.gate.issue(record)?;

        metrics::counter!(
            RECORDS_DELIVERED,
            "topic" => partition.topic().to_string(),
            "partition" => partition.partition_number().to_string()
        )
        .increment(1);

        let start = Instant::now();
        let result = self.processor.process(record, &handle).await;
        metrics::histogram!(RECORD_PROCESSING_DURATION).record(start.elapsed().as_secs_f64());

        if lifecycle.commit_attempted_in_flight() {
            lifecycle.retire();
            error!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = offset,
                "Processor committed before its processing call returned"
            );
            return Err(ConsumerError::InvalidCommitOrder {
                partition: partition.clone(),
                offset,
            });
        }

        if let Err(source) = result {
            lifecycle.retire();
            let failure = ConsumerError::ProcessingFailure {
                partition: partition.clone(),
                offset,
                source,
            };
            self.controller.on_failure(partition, offset, &failure)?;
            return Ok(false);
        }

        self.ledger.record_processed(partition, offset)?;
        lifecycle.complete();
        self.controller.on_success(partition, offset);

        let after = self.processor.on_processed(record, handle).await;
        lifecycle.retire();

        match after {
            Ok(()) => Ok(true),
            Err(e) if e.is_fatal() => {
                error!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    error = ?e,
                    "Fatal error after processing record"
                );
                Err(e)
            }
            Err(e) => {
                // Processed but not committed: halting rewinds to the last
                // commit, so the record is delivered again.
                self.controller.on_failure(partition, offset, &e)?;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitHandle;
    use crate::controller::RetryPhase;
    use crate::retry::RetryPolicy;
    use crate::test_utils::{FailNthDelivery, MemoryBroker, RecordingProcessor};
    use async_trait::async_trait;
    use bytes::Bytes;

    struct Harness {
        ledger: Arc<OffsetLedger>,
        controller: Arc<BreakOnErrorController>,
        broker: Arc<MemoryBroker>,
        pipeline: DeliveryPipeline,
        partition: Partition,
    }

    fn harness(processor: Arc<dyn RecordProcessor>) -> Harness {
        let partition = Partition::new("inbound-topic", 0);
        let broker = Arc::new(MemoryBroker::new());
        broker.create_topic("inbound-topic", 1);
        let ledger = Arc::new(OffsetLedger::new());
        ledger.assign(&partition, 0);
        let controller = Arc::new(BreakOnErrorController::new(
            ledger.clone(),
            RetryPolicy::immediate(),
        ));
        let gate = CommitGate::new(ledger.clone(), broker.clone());
        let pipeline = DeliveryPipeline::new(ledger.clone(), controller.clone(), gate, processor);

        Harness {
            ledger,
            controller,
            broker,
            pipeline,
            partition,
        }
    }

    fn records(partition: &Partition, offsets: std::ops::Range<i64>) -> Vec<Record> {
        offsets
            .map(|o| {
                Record::new(
                    partition.clone(),
                    o,
                    None,
                    Some(Bytes::from(o.to_string())),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_delivers_and_commits_in_order() {
        let processor = Arc::new(RecordingProcessor::committing(FailNthDelivery::never()));
        let h = harness(processor.clone());

        let outcome = h
            .pipeline
            .deliver_partition(&h.partition, records(&h.partition, 0..5))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            PartitionOutcome {
                processed: 5,
                skipped: 0,
                failed_at: None
            }
        );
        assert_eq!(processor.outputs(), vec!["0", "1", "2", "3", "4"]);
        let cursor = h.ledger.cursor(&h.partition).unwrap();
        assert_eq!(cursor.next_offset_to_deliver, 5);
        assert_eq!(cursor.last_committed_offset, 4);
        assert_eq!(h.broker.committed_offset(&h.partition), Some(4));
    }

    #[tokio::test]
    async fn test_failure_halts_rest_of_batch() {
        let processor = Arc::new(RecordingProcessor::committing(FailNthDelivery::new(2, 1)));
        let h = harness(processor.clone());

        let outcome = h
            .pipeline
            .deliver_partition(&h.partition, records(&h.partition, 0..5))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            PartitionOutcome {
                processed: 2,
                skipped: 2,
                failed_at: Some(2)
            }
        );
        // nothing after the failing offset reached the processor
        assert_eq!(processor.attempted_offsets(), vec![0, 1, 2]);
        assert_eq!(processor.outputs(), vec!["0", "1"]);

        let cursor = h.ledger.cursor(&h.partition).unwrap();
        assert!(cursor.halted);
        assert_eq!(cursor.next_offset_to_deliver, 2);
        assert_eq!(cursor.last_committed_offset, 1);
        assert!(matches!(
            h.controller.phase(&h.partition),
            RetryPhase::Halted {
                failed_offset: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_halted_partition_delivers_nothing() {
        let processor = Arc::new(RecordingProcessor::committing(FailNthDelivery::never()));
        let h = harness(processor.clone());
        h.ledger.set_halted(&h.partition, true).unwrap();

        let outcome = h
            .pipeline
            .deliver_partition(&h.partition, records(&h.partition, 0..3))
            .await
            .unwrap();

        assert_eq!(outcome.processed, 0);
        assert_eq!(outcome.skipped, 3);
        assert!(processor.attempted_offsets().is_empty());
        assert_eq!(h.ledger.cursor(&h.partition).unwrap().next_offset_to_deliver, 0);
    }

    #[tokio::test]
    async fn test_redelivery_after_resume() {
        let processor = Arc::new(RecordingProcessor::committing(FailNthDelivery::new(2, 2)));
        let h = harness(processor.clone());

        h.pipeline
            .deliver_partition(&h.partition, records(&h.partition, 0..5))
            .await
            .unwrap();
        h.controller.prepare_poll(h.broker.as_ref()).await;

        let outcome = h
            .pipeline
            .deliver_partition(&h.partition, records(&h.partition, 2..7))
            .await
            .unwrap();
        assert_eq!(outcome.failed_at, Some(2));
        h.controller.prepare_poll(h.broker.as_ref()).await;

        let outcome = h
            .pipeline
            .deliver_partition(&h.partition, records(&h.partition, 2..7))
            .await
            .unwrap();
        assert_eq!(outcome.processed, 5);
        assert_eq!(h.controller.phase(&h.partition), RetryPhase::Running);
        assert_eq!(processor.outputs(), vec!["0", "1", "2", "3", "4", "5", "6"]);
        assert_eq!(processor.attempted_offsets(), vec![0, 1, 2, 2, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_out_of_sequence_record_is_fatal() {
        let processor = Arc::new(RecordingProcessor::committing(FailNthDelivery::never()));
        let h = harness(processor.clone());

        let result = h
            .pipeline
            .deliver_partition(&h.partition, records(&h.partition, 1..3))
            .await;

        assert!(matches!(
            result,
            Err(ConsumerError::SequenceViolation {
                expected: 0,
                actual: 1,
                ..
            })
        ));
        assert!(processor.attempted_offsets().is_empty());
    }

    /// Commits from inside `process`, which is not allowed
    struct EagerCommitter;

    #[async_trait]
    impl RecordProcessor for EagerCommitter {
        async fn process(&self, _record: &Record, commit: &CommitHandle) -> anyhow::Result<()> {
            commit.commit_sync().await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_commit_from_process_surfaces_invalid_order() {
        let h = harness(Arc::new(EagerCommitter));

        let result = h
            .pipeline
            .deliver_partition(&h.partition, records(&h.partition, 0..2))
            .await;

        // fatal even though the processor wrapped it into its own error
        assert!(matches!(
            result,
            Err(ConsumerError::InvalidCommitOrder { offset: 0, .. })
        ));
        assert_eq!(h.broker.committed_offset(&h.partition), None);
        assert_eq!(h.ledger.cursor(&h.partition).unwrap().last_committed_offset, -1);
    }

    /// Never commits; relies on the default `on_processed`
    struct NonCommitting {
        fail_offset: i64,
    }

    #[async_trait]
    impl RecordProcessor for NonCommitting {
        async fn process(&self, record: &Record, _commit: &CommitHandle) -> anyhow::Result<()> {
            if record.offset() == self.fail_offset {
                anyhow::bail!("failing offset {}", record.offset());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_uncommitted_records_are_rewound() {
        let h = harness(Arc::new(NonCommitting { fail_offset: 3 }));

        h.pipeline
            .deliver_partition(&h.partition, records(&h.partition, 0..5))
            .await
            .unwrap();
        h.controller.prepare_poll(h.broker.as_ref()).await;

        // nothing was committed, so delivery restarts at offset 0
        let cursor = h.ledger.cursor(&h.partition).unwrap();
        assert_eq!(cursor.next_offset_to_deliver, 0);
        assert_eq!(h.broker.seeks(), vec![(h.partition.clone(), 0)]);
    }
}
