//! Redelivery Consumer - the poll loop
//!
//! One poll cycle:
//! 1. reconcile the broker's assignment with the ledger (cursor + worker per
//!    partition, revoked partitions torn down)
//! 2. let the controller rewind and re-seek halted partitions whose backoff
//!    elapsed
//! 3. fetch up to `max_poll_records` for every assigned partition that is
//!    not backing off
//! 4. split the batch per partition, hand each slice to its worker and wait
//!    for every outcome before the next cycle

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::client::BrokerClient;
use crate::commit::CommitGate;
use crate::config::ConsumerConfig;
use crate::controller::BreakOnErrorController;
use crate::error::ConsumerError;
use crate::ledger::OffsetLedger;
use crate::metrics_consts::{
    CONSUMER_ASSIGNED_PARTITIONS, CONSUMER_BATCH_SIZE, CONSUMER_BROKER_ERRORS,
    CONSUMER_POLL_CYCLES,
};
use crate::partition_worker::PartitionWorker;
use crate::pipeline::{DeliveryPipeline, PartitionOutcome};
use crate::processor::RecordProcessor;
use crate::types::{Batch, Partition, Record};

pub struct RedeliveryConsumer {
    broker: Arc<dyn BrokerClient>,
    config: ConsumerConfig,
    ledger: Arc<OffsetLedger>,
    controller: Arc<BreakOnErrorController>,
    pipeline: DeliveryPipeline,
    workers: HashMap<Partition, PartitionWorker>,

    // shutdown signal from the parent process, which is expected to run
    // start_consumption in a spawned task
    shutdown_rx: oneshot::Receiver<()>,
}

impl RedeliveryConsumer {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        processor: Arc<dyn RecordProcessor>,
        config: ConsumerConfig,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> Self {
        let ledger = Arc::new(OffsetLedger::new());
        let controller = Arc::new(BreakOnErrorController::new(
            ledger.clone(),
            config.retry_policy.clone(),
        ));
        let gate = CommitGate::new(ledger.clone(), broker.clone());
        let pipeline = DeliveryPipeline::new(ledger.clone(), controller.clone(), gate, processor);

        Self {
            broker,
            config,
            ledger,
            controller,
            pipeline,
            workers: HashMap::new(),
            shutdown_rx,
        }
    }

    pub fn ledger(&self) -> Arc<OffsetLedger> {
        self.ledger.clone()
    }

    pub fn controller(&self) -> Arc<BreakOnErrorController> {
        self.controller.clone()
    }

    /// Run poll cycles until the shutdown signal fires or a fatal error occurs.
    ///
    /// The shutdown signal only interrupts a fetch. Slices already handed to
    /// workers run to completion before the consumer returns.
    pub async fn start_consumption(mut self) -> Result<(), ConsumerError> {
        info!(
            group_id = %self.config.group_id,
            topics = ?self.config.topics,
            max_poll_records = self.config.max_poll_records,
            "Starting redelivery consumer"
        );

        self.broker
            .subscribe(&self.config.topics, &self.config.group_id)
            .await
            .map_err(ConsumerError::Broker)?;

        let mut broker_error_count: u32 = 0;
        let result = loop {
            if let Err(e) = self.reconcile_assignment().await {
                break Err(e);
            }
            let backing_off = self.controller.prepare_poll(self.broker.as_ref()).await;
            let fetchable: HashSet<Partition> = self
                .workers
                .keys()
                .filter(|p| !backing_off.contains(*p))
                .cloned()
                .collect();

            let fetched = tokio::select! {
                _ = &mut self.shutdown_rx => {
                    info!("Shutdown signal received, starting graceful shutdown");
                    break Ok(());
                }
                fetched = self.broker.fetch(&fetchable) => fetched,
            };
            metrics::counter!(CONSUMER_POLL_CYCLES).increment(1);

            let records = match fetched {
                Ok(records) => {
                    broker_error_count = 0;
                    records
                }
                Err(e) => {
                    broker_error_count += 1;
                    warn!(error = ?e, attempt = broker_error_count, "Fetch failed");
                    metrics::counter!(CONSUMER_BROKER_ERRORS, "operation" => "fetch").increment(1);
                    sleep(Duration::from_millis(100 * u64::from(broker_error_count.min(10)))).await;
                    continue;
                }
            };

            if let Err(e) = self.dispatch(records).await {
                break Err(e);
            }
        };

        if let Err(e) = &result {
            error!(error = ?e, "Consumer stopping on fatal error");
        }
        self.shutdown().await;
        result
    }

    /// Bring workers and cursors in line with the broker's current assignment
    async fn reconcile_assignment(&mut self) -> Result<(), ConsumerError> {
        // A partition revoked and assigned back between two cycles restarts
        // from the broker's committed offset, so its old cursor must go too
        match self.broker.take_revoked().await {
            Ok(revoked) => {
                for partition in revoked {
                    if self.workers.contains_key(&partition) {
                        self.revoke_partition(&partition).await;
                    }
                }
            }
            Err(e) => {
                warn!(error = ?e, "Failed to read revoked partitions");
                metrics::counter!(CONSUMER_BROKER_ERRORS, "operation" => "revoked").increment(1);
            }
        }

        let assigned = match self.broker.assigned_partitions().await {
            Ok(assigned) => assigned,
            Err(e) => {
                // keep the previous view; the broker is asked again next cycle
                warn!(error = ?e, "Failed to read partition assignment");
                metrics::counter!(CONSUMER_BROKER_ERRORS, "operation" => "assignment")
                    .increment(1);
                return Ok(());
            }
        };

        let revoked: Vec<Partition> = self
            .workers
            .keys()
            .filter(|p| !assigned.contains(*p))
            .cloned()
            .collect();
        for partition in revoked {
            self.revoke_partition(&partition).await;
        }

        let mut added: Vec<Partition> = assigned
            .into_iter()
            .filter(|p| !self.workers.contains_key(p))
            .collect();
        added.sort();
        for partition in added {
            self.assign_partition(partition).await;
        }

        metrics::gauge!(CONSUMER_ASSIGNED_PARTITIONS).set(self.workers.len() as f64);
        Ok(())
    }

    async fn assign_partition(&mut self, partition: Partition) {
        let position = match self.broker.resume_position(&partition).await {
            Ok(position) => position,
            Err(e) => {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    error = ?e,
                    "Failed to resolve resume position - retrying next cycle"
                );
                metrics::counter!(CONSUMER_BROKER_ERRORS, "operation" => "resume_position")
                    .increment(1);
                return;
            }
        };

        // The broker may resolve its own start position otherwise
        if let Err(e) = self.broker.seek(&partition, position).await {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                position = position,
                error = ?e,
                "Failed to seek assigned partition - retrying next cycle"
            );
            metrics::counter!(CONSUMER_BROKER_ERRORS, "operation" => "seek").increment(1);
            return;
        }

        self.ledger.assign(&partition, position);
        let worker = PartitionWorker::new(
            partition.clone(),
            self.pipeline.clone(),
            &self.config.worker,
        );
        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            position = position,
            "Partition assigned"
        );
        self.workers.insert(partition, worker);
    }

    async fn revoke_partition(&mut self, partition: &Partition) {
        // Dropping the cursor first turns every outstanding handle stale
        self.ledger.revoke(partition);
        self.controller.forget(partition);
        if let Some(worker) = self.workers.remove(partition) {
            worker.shutdown().await;
        }
        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            "Partition revoked"
        );
    }

    /// Hand every partition slice to its worker and wait for all outcomes
    async fn dispatch(&mut self, records: Vec<Record>) -> Result<(), ConsumerError> {
        if records.is_empty() {
            return Ok(());
        }
        metrics::histogram!(CONSUMER_BATCH_SIZE).record(records.len() as f64);

        let batch = Batch::from_records(records);
        debug!(
            records = batch.record_count(),
            partitions = batch.partition_count(),
            "Dispatching batch"
        );

        let mut replies = Vec::with_capacity(batch.partition_count());
        for (partition, slice) in batch.into_partitions() {
            let Some(worker) = self.workers.get(&partition) else {
                // the broker returned records for a partition it never assigned
                return Err(ConsumerError::UnknownPartition(partition));
            };
            let reply = worker.send(slice).await?;
            replies.push((partition, reply));
        }

        let outcomes = join_all(replies.into_iter().map(|(partition, reply)| async move {
            let outcome = reply
                .await
                .map_err(|_| ConsumerError::WorkerGone(partition.clone()))?;
            outcome.map(|o| (partition, o))
        }))
        .await;

        let mut first_fatal = None;
        for outcome in outcomes {
            match outcome {
                Ok((partition, outcome)) => Self::log_outcome(&partition, &outcome),
                Err(e) if first_fatal.is_none() => first_fatal = Some(e),
                Err(e) => error!(error = ?e, "Additional fatal error in the same cycle"),
            }
        }

        match first_fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn log_outcome(partition: &Partition, outcome: &PartitionOutcome) {
        if let Some(failed_at) = outcome.failed_at {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                processed = outcome.processed,
                skipped = outcome.skipped,
                failed_at = failed_at,
                "Partition halted this cycle"
            );
        }
    }

    async fn shutdown(&mut self) {
        info!(workers = self.workers.len(), "Draining partition workers");
        for (_, worker) in self.workers.drain() {
            worker.shutdown().await;
        }
        self.ledger.clear_all();
        self.controller.clear_all();
        metrics::gauge!(CONSUMER_ASSIGNED_PARTITIONS).set(0.0);
        info!("Graceful shutdown completed");
    }
}
