//! Partition Worker - Dedicated delivery task for a single partition
//!
//! Each assigned partition gets its own worker with a bounded channel, so:
//! 1. records of a partition reach the processor strictly in offset order
//! 2. different partitions are processed in parallel
//! 3. the poll loop learns each slice's outcome before polling again

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ConsumerError;
use crate::pipeline::{DeliveryPipeline, PartitionOutcome};
use crate::types::{Partition, Record};

pub type DeliveryReply = oneshot::Receiver<Result<PartitionOutcome, ConsumerError>>;

/// One partition's slice of a poll batch plus the channel its outcome goes back on
pub struct PartitionBatch {
    pub partition: Partition,
    pub records: Vec<Record>,
    reply: oneshot::Sender<Result<PartitionOutcome, ConsumerError>>,
}

impl PartitionBatch {
    pub fn new(partition: Partition, records: Vec<Record>) -> (Self, DeliveryReply) {
        let (reply, receiver) = oneshot::channel();
        (
            Self {
                partition,
                records,
                reply,
            },
            receiver,
        )
    }
}

#[derive(Debug, Clone)]
pub struct PartitionWorkerConfig {
    /// Size of the channel buffer per partition
    pub channel_buffer_size: usize,
}

impl Default for PartitionWorkerConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: 4,
        }
    }
}

pub struct PartitionWorker {
    partition: Partition,
    sender: mpsc::Sender<PartitionBatch>,
    handle: Option<JoinHandle<()>>,
}

impl PartitionWorker {
    pub fn new(
        partition: Partition,
        pipeline: DeliveryPipeline,
        config: &PartitionWorkerConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.channel_buffer_size);
        let partition_clone = partition.clone();

        let handle = tokio::spawn(async move {
            Self::run_worker(partition_clone, receiver, pipeline).await;
        });

        Self {
            partition,
            sender,
            handle: Some(handle),
        }
    }

    /// Queue a slice for delivery and return the receiver for its outcome.
    /// Waits for channel capacity; fails only if the worker task is gone.
    pub async fn send(&self, records: Vec<Record>) -> Result<DeliveryReply, ConsumerError> {
        let (batch, reply) = PartitionBatch::new(self.partition.clone(), records);
        self.sender
            .send(batch)
            .await
            .map_err(|_| ConsumerError::WorkerGone(self.partition.clone()))?;
        Ok(reply)
    }

    /// Stop accepting slices, let queued ones finish, then wait for the task
    pub async fn shutdown(mut self) {
        drop(self.sender);

        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(()) => debug!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    "Partition worker shut down gracefully"
                ),
                Err(e) => warn!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    error = %e,
                    "Partition worker panicked during shutdown"
                ),
            }
        }
    }

    async fn run_worker(
        partition: Partition,
        mut receiver: mpsc::Receiver<PartitionBatch>,
        pipeline: DeliveryPipeline,
    ) {
        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            "Starting partition worker"
        );

        while let Some(batch) = receiver.recv().await {
            let record_count = batch.records.len();
            let first_offset = batch.records.first().map(Record::offset);
            let last_offset = batch.records.last().map(Record::offset);

            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                record_count = record_count,
                first_offset = ?first_offset,
                last_offset = ?last_offset,
                "Delivering partition slice"
            );

            let result = pipeline
                .deliver_partition(&batch.partition, batch.records)
                .await;

            if let Ok(outcome) = &result {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    processed = outcome.processed,
                    skipped = outcome.skipped,
                    failed_at = ?outcome.failed_at,
                    "Partition slice delivered"
                );
            }

            // The poll loop may have stopped waiting during shutdown
            if batch.reply.send(result).is_err() {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    "Outcome receiver dropped"
                );
            }
        }

        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            "Partition worker shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::time::sleep;

    use crate::commit::{CommitGate, CommitHandle};
    use crate::controller::BreakOnErrorController;
    use crate::ledger::OffsetLedger;
    use crate::processor::RecordProcessor;
    use crate::retry::RetryPolicy;
    use crate::test_utils::{FailNthDelivery, MemoryBroker, RecordingProcessor};

    /// Sleeps before recording each record
    struct SlowProcessor {
        inner: RecordingProcessor,
        delay: Duration,
    }

    #[async_trait]
    impl RecordProcessor for SlowProcessor {
        async fn process(&self, record: &Record, commit: &CommitHandle) -> Result<()> {
            sleep(self.delay).await;
            self.inner.process(record, commit).await
        }

        async fn on_processed(
            &self,
            record: &Record,
            commit: CommitHandle,
        ) -> Result<(), ConsumerError> {
            self.inner.on_processed(record, commit).await
        }
    }

    fn worker_for(
        partition: &Partition,
        processor: Arc<dyn RecordProcessor>,
    ) -> (PartitionWorker, Arc<OffsetLedger>, Arc<MemoryBroker>) {
        let broker = Arc::new(MemoryBroker::new());
        broker.create_topic(partition.topic(), 1);
        let ledger = Arc::new(OffsetLedger::new());
        ledger.assign(partition, 0);
        let controller = Arc::new(BreakOnErrorController::new(
            ledger.clone(),
            RetryPolicy::immediate(),
        ));
        let gate = CommitGate::new(ledger.clone(), broker.clone());
        let pipeline = DeliveryPipeline::new(ledger.clone(), controller, gate, processor);
        let worker = PartitionWorker::new(
            partition.clone(),
            pipeline,
            &PartitionWorkerConfig::default(),
        );
        (worker, ledger, broker)
    }

    fn records(partition: &Partition, offsets: std::ops::Range<i64>) -> Vec<Record> {
        offsets
            .map(|o| Record::new(partition.clone(), o, None, Some(Bytes::from(format!("msg{o}")))))
            .collect()
    }

    #[tokio::test]
    async fn test_worker_replies_with_outcome() {
        let partition = Partition::new("test-topic", 0);
        let processor = Arc::new(RecordingProcessor::committing(FailNthDelivery::never()));
        let (worker, ledger, broker) = worker_for(&partition, processor.clone());

        let reply = worker.send(records(&partition, 0..3)).await.unwrap();
        let outcome = reply.await.unwrap().unwrap();

        assert_eq!(outcome.processed, 3);
        assert_eq!(outcome.failed_at, None);
        assert_eq!(processor.outputs(), vec!["msg0", "msg1", "msg2"]);
        assert_eq!(ledger.cursor(&partition).unwrap().next_offset_to_deliver, 3);
        assert_eq!(broker.committed_offset(&partition), Some(2));

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_reports_halt() {
        let partition = Partition::new("test-topic", 0);
        let processor = Arc::new(RecordingProcessor::committing(FailNthDelivery::new(1, 1)));
        let (worker, ledger, _broker) = worker_for(&partition, processor.clone());

        let outcome = worker
            .send(records(&partition, 0..4))
            .await
            .unwrap()
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.skipped, 2);
        assert_eq!(outcome.failed_at, Some(1));
        assert!(ledger.is_halted(&partition));

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_returns_fatal_errors() {
        let partition = Partition::new("test-topic", 0);
        let processor = Arc::new(RecordingProcessor::committing(FailNthDelivery::never()));
        let (worker, _ledger, _broker) = worker_for(&partition, processor);

        // cursor expects offset 0
        let result = worker
            .send(records(&partition, 5..6))
            .await
            .unwrap()
            .await
            .unwrap();

        assert!(matches!(
            result,
            Err(ConsumerError::SequenceViolation {
                expected: 0,
                actual: 5,
                ..
            })
        ));

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_drains_queue_on_shutdown() {
        let partition = Partition::new("test-topic", 0);
        let processor = Arc::new(SlowProcessor {
            inner: RecordingProcessor::committing(FailNthDelivery::never()),
            delay: Duration::from_millis(5),
        });
        let (worker, _ledger, broker) = worker_for(&partition, processor.clone());

        let mut replies = Vec::new();
        for slice in 0..3 {
            let start = slice * 2;
            replies.push(worker.send(records(&partition, start..start + 2)).await.unwrap());
        }

        worker.shutdown().await;

        assert_eq!(processor.inner.outputs().len(), 6);
        assert_eq!(broker.committed_offset(&partition), Some(5));
        for reply in replies {
            assert!(reply.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_worker_keeps_processing_when_reply_dropped() {
        let partition = Partition::new("test-topic", 0);
        let processor = Arc::new(RecordingProcessor::committing(FailNthDelivery::never()));
        let (worker, _ledger, _broker) = worker_for(&partition, processor.clone());

        drop(worker.send(records(&partition, 0..1)).await.unwrap());
        let reply = worker.send(records(&partition, 1..2)).await.unwrap();

        assert_eq!(reply.await.unwrap().unwrap().processed, 1);
        assert_eq!(processor.outputs(), vec!["msg0", "msg1"]);

        worker.shutdown().await;
    }
}
