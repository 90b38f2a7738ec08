//! Test utilities shared by unit tests and the tests/ directory
//!
//! [`MemoryBroker`] stands in for a Kafka cluster: an in-process partitioned
//! log with per-partition fetch positions and a committed-offset table.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use crate::client::BrokerClient;
use crate::commit::CommitHandle;
use crate::error::ConsumerError;
use crate::processor::RecordProcessor;
use crate::types::{Partition, Record};

#[derive(Default)]
struct BrokerState {
    logs: HashMap<Partition, Vec<Record>>,
    // next offset each assigned partition fetches from
    positions: HashMap<Partition, i64>,
    // record offsets, as passed to flush_commit
    committed: HashMap<Partition, i64>,
    assigned: HashSet<Partition>,
    // revoked since the consumer last asked
    revoked: HashSet<Partition>,
    subscription: Option<(Vec<String>, String)>,
    seeks: Vec<(Partition, i64)>,
    commits: Vec<(Partition, i64)>,
    fetches: usize,
}

pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    max_poll_records: usize,
    empty_poll_delay: Duration,
    failing_commits: AtomicUsize,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            max_poll_records: 500,
            empty_poll_delay: Duration::from_millis(5),
            failing_commits: AtomicUsize::new(0),
        }
    }

    pub fn with_max_poll_records(mut self, max_poll_records: usize) -> Self {
        self.max_poll_records = max_poll_records;
        self
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let mut state = self.state.lock().unwrap();
        for number in 0..partitions {
            state.logs.entry(Partition::new(topic, number)).or_default();
        }
    }

    /// Append a record and return its offset
    pub fn produce(&self, topic: &str, partition: i32, key: Option<&str>, value: &str) -> i64 {
        let partition = Partition::new(topic, partition);
        let mut state = self.state.lock().unwrap();
        let log = state.logs.entry(partition.clone()).or_default();
        let offset = log.len() as i64;
        log.push(Record::new(
            partition,
            offset,
            key.map(|k| Bytes::copy_from_slice(k.as_bytes())),
            Some(Bytes::copy_from_slice(value.as_bytes())),
        ));
        offset
    }

    pub fn produce_all(&self, topic: &str, partition: i32, values: &[&str]) {
        for value in values {
            self.produce(topic, partition, None, value);
        }
    }

    /// Last committed record offset of `partition`
    pub fn committed_offset(&self, partition: &Partition) -> Option<i64> {
        self.state.lock().unwrap().committed.get(partition).copied()
    }

    /// Every successful commit, in order
    pub fn commits(&self) -> Vec<(Partition, i64)> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn seeks(&self) -> Vec<(Partition, i64)> {
        self.state.lock().unwrap().seeks.clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.state.lock().unwrap().fetches
    }

    pub fn subscription(&self) -> Option<(Vec<String>, String)> {
        self.state.lock().unwrap().subscription.clone()
    }

    /// Make the next `count` commits fail
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Simulate a rebalance taking `partition` away from this member
    pub fn revoke(&self, partition: &Partition) {
        let mut state = self.state.lock().unwrap();
        state.assigned.remove(partition);
        state.positions.remove(partition);
        state.revoked.insert(partition.clone());
    }

    /// Simulate a rebalance handing `partition` (back) to this member
    pub fn assign(&self, partition: &Partition) {
        let mut state = self.state.lock().unwrap();
        let position = state.committed.get(partition).map_or(0, |c| c + 1);
        state.assigned.insert(partition.clone());
        state.positions.insert(partition.clone(), position);
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn subscribe(&self, topics: &[String], group_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let partitions: Vec<Partition> = state
            .logs
            .keys()
            .filter(|p| topics.iter().any(|t| t == p.topic()))
            .cloned()
            .collect();

        for partition in partitions {
            let position = state.committed.get(&partition).map_or(0, |c| c + 1);
            state.positions.insert(partition.clone(), position);
            state.assigned.insert(partition);
        }
        state.subscription = Some((topics.to_vec(), group_id.to_string()));
        info!(group_id = group_id, topics = ?topics, "Memory broker subscription");
        Ok(())
    }

    async fn assigned_partitions(&self) -> Result<HashSet<Partition>> {
        Ok(self.state.lock().unwrap().assigned.clone())
    }

    async fn take_revoked(&self) -> Result<HashSet<Partition>> {
        Ok(std::mem::take(&mut self.state.lock().unwrap().revoked))
    }

    async fn resume_position(&self, partition: &Partition) -> Result<i64> {
        let state = self.state.lock().unwrap();
        if !state.logs.contains_key(partition) {
            bail!("unknown partition {partition}");
        }
        Ok(state.committed.get(partition).map_or(0, |c| c + 1))
    }

    async fn fetch(&self, partitions: &HashSet<Partition>) -> Result<Vec<Record>> {
        let records = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            state.fetches += 1;

            let mut wanted: Vec<&Partition> = partitions
                .iter()
                .filter(|p| state.assigned.contains(*p))
                .collect();
            wanted.sort();

            let mut records = Vec::new();
            for partition in wanted {
                let remaining = self.max_poll_records - records.len();
                if remaining == 0 {
                    break;
                }
                let position = state.positions.get(partition).copied().unwrap_or(0);
                let log = state.logs.get(partition).map(|l| l.as_slice()).unwrap_or(&[]);
                let start = (position.max(0) as usize).min(log.len());
                let end = (start + remaining).min(log.len());

                records.extend_from_slice(&log[start..end]);
                state.positions.insert(partition.clone(), end as i64);
            }
            records
        };

        if records.is_empty() {
            tokio::time::sleep(self.empty_poll_delay).await;
        }
        Ok(records)
    }

    async fn seek(&self, partition: &Partition, offset: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.logs.contains_key(partition) {
            bail!("cannot seek unknown partition {partition}");
        }
        state.positions.insert(partition.clone(), offset);
        state.seeks.push((partition.clone(), offset));
        Ok(())
    }

    async fn flush_commit(&self, partition: &Partition, offset: i64) -> Result<()> {
        let failing = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(anyhow!("simulated commit failure for {partition} at {offset}"));
        }

        let mut state = self.state.lock().unwrap();
        state.committed.insert(partition.clone(), offset);
        state.commits.push((partition.clone(), offset));
        Ok(())
    }
}

/// Deterministic failure injection: the first `failures` deliveries of the
/// record at `offset` fail, later deliveries succeed.
pub struct FailNthDelivery {
    partition_number: Option<i32>,
    offset: Option<i64>,
    failures: u32,
    attempts: Mutex<HashMap<(Partition, i64), u32>>,
}

impl FailNthDelivery {
    /// Applies to `offset` on every partition
    pub fn new(offset: i64, failures: u32) -> Self {
        Self {
            partition_number: None,
            offset: Some(offset),
            failures,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn on_partition(partition_number: i32, offset: i64, failures: u32) -> Self {
        Self {
            partition_number: Some(partition_number),
            ..Self::new(offset, failures)
        }
    }

    pub fn never() -> Self {
        Self {
            partition_number: None,
            offset: None,
            failures: 0,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Count a delivery of `record`; returns the failing attempt number if
    /// this delivery has to fail.
    pub fn should_fail(&self, record: &Record) -> Option<u32> {
        if self.offset != Some(record.offset()) {
            return None;
        }
        if self
            .partition_number
            .is_some_and(|n| n != record.partition().partition_number())
        {
            return None;
        }
        let mut attempts = self.attempts.lock().unwrap();
        let attempt = attempts
            .entry((record.partition().clone(), record.offset()))
            .or_insert(0);
        *attempt += 1;
        (*attempt <= self.failures).then_some(*attempt)
    }
}

/// Processor that records every delivery, forwards successful values to an
/// in-memory "downstream" list and optionally commits each record.
pub struct RecordingProcessor {
    failures: FailNthDelivery,
    commit: bool,
    attempts: Mutex<Vec<Record>>,
    outputs: Mutex<Vec<String>>,
    commit_errors: Mutex<Vec<String>>,
}

impl RecordingProcessor {
    pub fn committing(failures: FailNthDelivery) -> Self {
        Self::new(failures, true)
    }

    pub fn non_committing(failures: FailNthDelivery) -> Self {
        Self::new(failures, false)
    }

    fn new(failures: FailNthDelivery, commit: bool) -> Self {
        Self {
            failures,
            commit,
            attempts: Mutex::new(Vec::new()),
            outputs: Mutex::new(Vec::new()),
            commit_errors: Mutex::new(Vec::new()),
        }
    }

    /// Values that made it downstream, in order
    pub fn outputs(&self) -> Vec<String> {
        self.outputs.lock().unwrap().clone()
    }

    /// Every record handed to `process`, including failed attempts
    pub fn attempts(&self) -> Vec<Record> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn attempted_offsets(&self) -> Vec<i64> {
        self.attempts().iter().map(|r| r.offset()).collect()
    }

    pub fn commit_errors(&self) -> Vec<String> {
        self.commit_errors.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordProcessor for RecordingProcessor {
    async fn process(&self, record: &Record, _commit: &CommitHandle) -> Result<()> {
        self.attempts.lock().unwrap().push(record.clone());
        let body = record.value_str().unwrap_or_default().to_string();

        if let Some(attempt) = self.failures.should_fail(record) {
            bail!(
                "{body} (offset={}) - failed processing {attempt} time",
                record.offset()
            );
        }

        self.outputs.lock().unwrap().push(body);
        Ok(())
    }

    async fn on_processed(&self, _record: &Record, commit: CommitHandle) -> Result<(), ConsumerError> {
        if !self.commit {
            return Ok(());
        }
        if let Err(e) = commit.commit_sync().await {
            self.commit_errors.lock().unwrap().push(e.to_string());
            return Err(e);
        }
        Ok(())
    }
}
