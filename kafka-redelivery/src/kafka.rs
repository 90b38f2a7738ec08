//! Kafka-backed [`BrokerClient`] over librdkafka
//!
//! The adapter keeps the group protocol inside librdkafka and only exposes
//! what the poll loop needs. Newly assigned partitions are paused in the
//! rebalance callback and stay paused until the consumer asks for them, so no
//! record is fetched before the partition has a cursor. Partitions left out of
//! a fetch (halted ones backing off) are paused for that fetch.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::client::BrokerClient;
use crate::config::ConsumerConfig;
use crate::metrics_consts::{
    CONSUMER_BROKER_ERRORS, KAFKA_REBALANCE_EVENTS, KAFKA_UNREQUESTED_RECORDS,
};
use crate::types::{Partition, Record};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Kafka consumer configuration builder with defaults for a manually
/// committing group consumer.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    /// Group-based consumer defaults.
    ///
    /// Sets: auto.offset.store=false, auto.commit=false, socket.timeout.ms,
    /// session.timeout.ms, heartbeat.interval.ms, max.poll.interval.ms.
    pub fn for_batch_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        // Offsets only move through commit_sync
        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    pub fn with_offset_reset(mut self, policy: OffsetReset) -> Self {
        self.config.set("auto.offset.reset", policy.as_str());
        self
    }

    /// Set maximum time between poll() calls before consumer leaves group.
    /// A processing call that never returns eventually trips this.
    pub fn with_max_poll_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("max.poll.interval.ms", ms.to_string());
        self
    }

    pub fn with_session_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("session.timeout.ms", ms.to_string());
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Where a partition without a committed offset starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

impl FromStr for OffsetReset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" | "smallest" | "beginning" => Ok(OffsetReset::Earliest),
            "latest" | "largest" | "end" => Ok(OffsetReset::Latest),
            other => Err(anyhow!("unsupported offset reset policy: {other}")),
        }
    }
}

/// Rebalance callbacks: pause fresh assignments, keep the paused set in sync
/// and remember revokes until the consumer has seen them
pub struct RedeliveryContext {
    paused: Arc<Mutex<HashSet<Partition>>>,
    revoked: Arc<Mutex<HashSet<Partition>>>,
}

impl RedeliveryContext {
    fn partitions(list: &TopicPartitionList) -> Vec<Partition> {
        list.elements()
            .iter()
            .map(|e| Partition::new(e.topic(), e.partition()))
            .collect()
    }
}

impl ClientContext for RedeliveryContext {}

impl ConsumerContext for RedeliveryContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Revoke(partitions) = rebalance {
            info!(count = partitions.count(), "Revoking partitions");
            metrics::counter!(KAFKA_REBALANCE_EVENTS, "event_type" => "revoke").increment(1);

            let revoked = Self::partitions(partitions);
            if let Ok(mut paused) = self.paused.lock() {
                for partition in &revoked {
                    paused.remove(partition);
                }
            }
            // An assign in the same poll must not hide the revoke
            if let Ok(mut pending) = self.revoked.lock() {
                pending.extend(revoked);
            }
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                if partitions.count() == 0 {
                    return;
                }
                metrics::counter!(KAFKA_REBALANCE_EVENTS, "event_type" => "assign").increment(1);

                // Nothing may be fetched before the consumer created the cursor
                if let Err(e) = base_consumer.pause(partitions) {
                    error!(
                        count = partitions.count(),
                        error = %e,
                        "Failed to pause newly assigned partitions"
                    );
                    return;
                }
                if let Ok(mut paused) = self.paused.lock() {
                    paused.extend(Self::partitions(partitions));
                }
                info!(
                    count = partitions.count(),
                    "Assigned partitions - paused until the consumer requests them"
                );
            }
            Rebalance::Revoke(_) => debug!("Post-rebalance revoke event"),
            Rebalance::Error(e) => {
                error!(error = %e, "Rebalance error");
                metrics::counter!(KAFKA_REBALANCE_EVENTS, "event_type" => "error").increment(1);
            }
        }
    }
}

pub struct RdKafkaBroker {
    consumer: Arc<BaseConsumer<RedeliveryContext>>,
    group_id: String,
    offset_reset: OffsetReset,
    max_poll_records: usize,
    poll_timeout: Duration,
    paused: Arc<Mutex<HashSet<Partition>>>,
    revoked: Arc<Mutex<HashSet<Partition>>>,
}

impl RdKafkaBroker {
    pub fn new(
        client_config: &ClientConfig,
        consumer_config: &ConsumerConfig,
        offset_reset: OffsetReset,
    ) -> Result<Self> {
        let paused = Arc::new(Mutex::new(HashSet::new()));
        let revoked = Arc::new(Mutex::new(HashSet::new()));
        let context = RedeliveryContext {
            paused: paused.clone(),
            revoked: revoked.clone(),
        };
        let consumer: BaseConsumer<RedeliveryContext> = client_config
            .create_with_context(context)
            .context("Failed to create Kafka consumer")?;

        Ok(Self {
            consumer: Arc::new(consumer),
            group_id: consumer_config.group_id.clone(),
            offset_reset,
            max_poll_records: consumer_config.max_poll_records,
            poll_timeout: consumer_config.poll_timeout,
            paused,
            revoked,
        })
    }

    /// Run a librdkafka call that may block on the network off the runtime
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&BaseConsumer<RedeliveryContext>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || f(&consumer))
            .await
            .context("rdkafka task panicked")?
    }

    /// Pause assigned partitions the caller left out and resume the ones it
    /// asked for again.
    fn apply_pauses(&self, wanted: &HashSet<Partition>) -> Result<()> {
        let assignment = self
            .consumer
            .assignment()
            .context("Failed to read assignment")?;
        let mut paused = self
            .paused
            .lock()
            .map_err(|_| anyhow!("paused partition set poisoned"))?;

        let mut pause = TopicPartitionList::new();
        let mut resume = TopicPartitionList::new();
        for partition in RedeliveryContext::partitions(&assignment) {
            let is_paused = paused.contains(&partition);
            let is_wanted = wanted.contains(&partition);
            if is_wanted && is_paused {
                resume.add_partition(partition.topic(), partition.partition_number());
                paused.remove(&partition);
            } else if !is_wanted && !is_paused {
                pause.add_partition(partition.topic(), partition.partition_number());
                paused.insert(partition);
            }
        }

        if pause.count() > 0 {
            self.consumer
                .pause(&pause)
                .context("Failed to pause partitions")?;
        }
        if resume.count() > 0 {
            self.consumer
                .resume(&resume)
                .context("Failed to resume partitions")?;
        }
        Ok(())
    }

    /// Poll until `max_records` records arrived or `timeout` elapsed.
    ///
    /// Records of partitions outside `wanted` (queued before a pause took
    /// effect) are dropped and their partition is seeked back to the first
    /// dropped offset, so they are fetched again once requested. Records of a
    /// partition revoked during the poll are dropped too: the consumer
    /// discards its cursor and the partition restarts from the committed
    /// offset.
    fn poll_records(
        consumer: &BaseConsumer<RedeliveryContext>,
        wanted: &HashSet<Partition>,
        revoked: &Mutex<HashSet<Partition>>,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>> {
        let deadline = Instant::now() + timeout;
        let mut records = Vec::new();
        let mut rewinds: HashMap<Partition, i64> = HashMap::new();

        while records.len() < max_records {
            // Once something arrived, only drain what is already queued
            let wait = if records.is_empty() {
                deadline.saturating_duration_since(Instant::now())
            } else {
                Duration::ZERO
            };

            match consumer.poll(wait) {
                None => break,
                Some(Ok(message)) => {
                    let partition = Partition::new(message.topic(), message.partition());
                    if !wanted.contains(&partition) {
                        rewinds.entry(partition).or_insert(message.offset());
                        continue;
                    }
                    records.push(Record::new(
                        partition,
                        message.offset(),
                        message.key().map(Bytes::copy_from_slice),
                        message.payload().map(Bytes::copy_from_slice),
                    ));
                }
                Some(Err(e)) => {
                    if Self::is_fatal(&e) {
                        return Err(e).context("Fatal Kafka consumer error");
                    }
                    if !records.is_empty() {
                        break;
                    }
                }
            }
        }

        for (partition, offset) in rewinds {
            metrics::counter!(KAFKA_UNREQUESTED_RECORDS).increment(1);
            if let Err(e) = consumer.seek(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(offset),
                METADATA_TIMEOUT,
            ) {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    error = %e,
                    "Failed to seek back unrequested partition"
                );
            }
        }

        let revoked = revoked
            .lock()
            .map_err(|_| anyhow!("revoked partition set poisoned"))?;
        if !revoked.is_empty() {
            records.retain(|r| !revoked.contains(r.partition()));
        }

        Ok(records)
    }

    fn is_fatal(e: &KafkaError) -> bool {
        match e {
            KafkaError::MessageConsumption(code) => {
                match code {
                    RDKafkaErrorCode::PartitionEOF | RDKafkaErrorCode::OperationTimedOut => {}
                    _ => warn!(code = ?code, "Kafka consumer error"),
                }
                metrics::counter!(CONSUMER_BROKER_ERRORS, "operation" => "poll", "level" => "info")
                    .increment(1);
                false
            }
            KafkaError::MessageConsumptionFatal(code) => {
                error!(code = ?code, "Fatal Kafka consumer error");
                metrics::counter!(CONSUMER_BROKER_ERRORS, "operation" => "poll", "level" => "fatal")
                    .increment(1);
                true
            }
            KafkaError::Global(RDKafkaErrorCode::Authentication) | KafkaError::Canceled => {
                error!(error = %e, "Kafka consumer stopped");
                metrics::counter!(CONSUMER_BROKER_ERRORS, "operation" => "poll", "level" => "fatal")
                    .increment(1);
                true
            }
            _ => {
                warn!(error = %e, "Kafka error while polling");
                metrics::counter!(CONSUMER_BROKER_ERRORS, "operation" => "poll", "level" => "warn")
                    .increment(1);
                false
            }
        }
    }
}

#[async_trait]
impl BrokerClient for RdKafkaBroker {
    async fn subscribe(&self, topics: &[String], group_id: &str) -> Result<()> {
        // group.id is fixed when the client is created
        if group_id != self.group_id {
            bail!(
                "consumer was created for group {} but asked to join {group_id}",
                self.group_id
            );
        }
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topic_refs)
            .with_context(|| format!("Failed to subscribe to topics: {topics:?}"))?;
        info!(group_id = group_id, topics = ?topics, "Subscribed");
        Ok(())
    }

    async fn assigned_partitions(&self) -> Result<HashSet<Partition>> {
        let assignment = self
            .consumer
            .assignment()
            .context("Failed to read assignment")?;
        Ok(RedeliveryContext::partitions(&assignment)
            .into_iter()
            .collect())
    }

    async fn take_revoked(&self) -> Result<HashSet<Partition>> {
        let mut revoked = self
            .revoked
            .lock()
            .map_err(|_| anyhow!("revoked partition set poisoned"))?;
        Ok(std::mem::take(&mut *revoked))
    }

    async fn resume_position(&self, partition: &Partition) -> Result<i64> {
        let partition = partition.clone();
        let offset_reset = self.offset_reset;

        self.blocking(move |consumer| {
            let topic = partition.topic();
            let number = partition.partition_number();

            let (low, high) = consumer
                .fetch_watermarks(topic, number, METADATA_TIMEOUT)
                .with_context(|| format!("Failed to fetch watermarks for {partition}"))?;

            let mut list = TopicPartitionList::new();
            list.add_partition(topic, number);
            let committed = consumer
                .committed_offsets(list, METADATA_TIMEOUT)
                .with_context(|| format!("Failed to fetch committed offset for {partition}"))?;

            let committed = committed
                .find_partition(topic, number)
                .and_then(|e| match e.offset() {
                    Offset::Offset(o) => Some(o),
                    _ => None,
                });

            Ok(match committed {
                Some(o) if (low..=high).contains(&o) => o,
                _ => match offset_reset {
                    OffsetReset::Earliest => low,
                    OffsetReset::Latest => high,
                },
            })
        })
        .await
    }

    async fn fetch(&self, partitions: &HashSet<Partition>) -> Result<Vec<Record>> {
        self.apply_pauses(partitions)?;

        let wanted = partitions.clone();
        let revoked = self.revoked.clone();
        let max_records = self.max_poll_records;
        let timeout = self.poll_timeout;
        self.blocking(move |consumer| {
            Self::poll_records(consumer, &wanted, &revoked, max_records, timeout)
        })
        .await
    }

    async fn seek(&self, partition: &Partition, offset: i64) -> Result<()> {
        let partition = partition.clone();
        self.blocking(move |consumer| {
            consumer
                .seek(
                    partition.topic(),
                    partition.partition_number(),
                    Offset::Offset(offset),
                    METADATA_TIMEOUT,
                )
                .with_context(|| format!("Failed to seek {partition} to {offset}"))
        })
        .await
    }

    async fn flush_commit(&self, partition: &Partition, offset: i64) -> Result<()> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(offset + 1),
        )
        .context("Failed to build commit list")?;

        let description = partition.to_string();
        self.blocking(move |consumer| {
            consumer
                .commit(&list, CommitMode::Sync)
                .with_context(|| format!("Failed to commit {description} at {offset}"))
        })
        .await
    }
}
