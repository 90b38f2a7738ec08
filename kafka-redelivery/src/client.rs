use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{Partition, Record};

/// The lower-level broker client the consumer is built on.
///
/// Implementations own the wire protocol and group membership. The consumer
/// only asks for records, repositions partitions and flushes commits.
///
/// # Offsets
///
/// Offsets passed to [`flush_commit`](BrokerClient::flush_commit) are record
/// offsets: "everything up to and including this record is done". Kafka-backed
/// implementations commit `offset + 1`, the next offset to consume.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Join `group_id` and subscribe to `topics`
    async fn subscribe(&self, topics: &[String], group_id: &str) -> Result<()>;

    /// Partitions currently assigned to this member. Rebalances show up here
    /// as partitions appearing or disappearing between calls.
    async fn assigned_partitions(&self) -> Result<HashSet<Partition>>;

    /// Partitions revoked since the previous call, including ones that were
    /// assigned back in the meantime. The consumer discards their cursors
    /// before looking at the current assignment.
    async fn take_revoked(&self) -> Result<HashSet<Partition>> {
        Ok(HashSet::new())
    }

    /// Offset a freshly assigned partition starts from: the group's committed
    /// position, or the reset policy's start when nothing was committed.
    async fn resume_position(&self, partition: &Partition) -> Result<i64>;

    /// Fetch the next records for `partitions`, blocking up to the poll
    /// timeout. Returns an empty list on timeout. Records of a partition must
    /// come back in ascending offset order.
    async fn fetch(&self, partitions: &HashSet<Partition>) -> Result<Vec<Record>>;

    /// Reposition the next fetch of `partition` to `offset`
    async fn seek(&self, partition: &Partition, offset: i64) -> Result<()>;

    /// Durably commit `offset` (a record offset) for `partition`
    async fn flush_commit(&self, partition: &Partition, offset: i64) -> Result<()>;
}
