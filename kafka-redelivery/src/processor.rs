use anyhow::Result;
use async_trait::async_trait;

use crate::commit::CommitHandle;
use crate::error::ConsumerError;
use crate::types::Record;

/// User processing function driven by the delivery pipeline.
///
/// Records of one partition are delivered one at a time, in offset order.
/// Returning an error from [`process`](RecordProcessor::process) halts the
/// partition and the same record is delivered again on a later poll cycle.
///
/// Commits are manual. The handle passed to `process` belongs to a record
/// that is still in flight, so committing it there fails with
/// `InvalidCommitOrder`. Commit from [`on_processed`](RecordProcessor::on_processed),
/// which runs after `process` returned successfully and before the next
/// record is delivered.
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    async fn process(&self, record: &Record, commit: &CommitHandle) -> Result<()>;

    /// Runs after a successful `process` call. The default leaves the record
    /// uncommitted; it will be redelivered if the partition halts later.
    async fn on_processed(
        &self,
        _record: &Record,
        commit: CommitHandle,
    ) -> Result<(), ConsumerError> {
        drop(commit);
        Ok(())
    }
}
