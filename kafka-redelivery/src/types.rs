use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

/// A single record fetched from a partition. Never mutated after the fetcher
/// builds it, so a redelivered record compares equal to the first delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    partition: Partition,
    offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

impl Record {
    pub fn new(
        partition: Partition,
        offset: i64,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Self {
        Self {
            partition,
            offset,
            key,
            value,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Payload as UTF-8, `None` for tombstones or binary payloads
    pub fn value_str(&self) -> Option<&str> {
        self.value
            .as_deref()
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }
}

/// Records of one poll cycle, grouped by partition. Each partition's records
/// are kept in ascending offset order.
#[derive(Debug, Default)]
pub struct Batch {
    partitions: HashMap<Partition, Vec<Record>>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group a flat fetch result by partition, sorting each group by offset
    pub fn from_records(records: Vec<Record>) -> Self {
        let mut batch = Self::new();
        for record in records {
            batch.push(record);
        }
        for records in batch.partitions.values_mut() {
            records.sort_by_key(|r| r.offset());
        }
        batch
    }

    fn push(&mut self, record: Record) {
        self.partitions
            .entry(record.partition().clone())
            .or_default()
            .push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.values().all(|r| r.is_empty())
    }

    pub fn record_count(&self) -> usize {
        self.partitions.values().map(|r| r.len()).sum()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn records(&self, partition: &Partition) -> Option<&[Record]> {
        self.partitions.get(partition).map(|r| r.as_slice())
    }

    // consume this Batch, handing out each partition's ordered records
    pub fn into_partitions(self) -> impl Iterator<Item = (Partition, Vec<Record>)> {
        self.partitions.into_iter()
    }
}
