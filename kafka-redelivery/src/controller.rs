//! Break-on-First-Error Controller
//!
//! Decides what happens to a partition after its processing function fails.
//!
//! # Per-partition state machine
//!
//! ```text
//!             on_failure(p)                    prepare_poll(): backoff elapsed
//! Running ───────────────────► Halted(p) ─────────────────────────────────► Resuming(p)
//!    ▲                            ▲            rewind cursor, seek(p, resume)      │
//!    │                            │                                               │
//!    │                            └──────────── on_failure(p) ◄───────────────────┤
//!    └────────────────────────── on_success(p, failed offset) ◄───────────────────┘
//! ```
//!
//! The controller never moves past a failing record on its own. Only a
//! successful processing call for that record unblocks the partition, so
//! retries are unbounded.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::client::BrokerClient;
use crate::error::ConsumerError;
use crate::ledger::OffsetLedger;
use crate::metrics_consts::{
    CONSUMER_BROKER_ERRORS, PARTITIONS_HALTED, PARTITION_HALTS, PARTITION_RESUMES,
    REDELIVERY_ATTEMPTS,
};
use crate::retry::RetryPolicy;
use crate::types::Partition;

/// Retry deadline used when the backoff does not fit in an `Instant`
const MAX_RETRY_DELAY: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    Running,
    /// Delivery stopped after `attempts` failures of `failed_offset`
    Halted {
        attempts: u32,
        failed_offset: i64,
        retry_at: Instant,
    },
    /// Re-seeked; waiting for `failed_offset` to be processed again
    Resuming { attempts: u32, failed_offset: i64 },
}

pub struct BreakOnErrorController {
    ledger: Arc<OffsetLedger>,
    retry_policy: RetryPolicy,
    phases: DashMap<Partition, RetryPhase>,
}

impl BreakOnErrorController {
    pub fn new(ledger: Arc<OffsetLedger>, retry_policy: RetryPolicy) -> Self {
        Self {
            ledger,
            retry_policy,
            phases: DashMap::new(),
        }
    }

    /// Halt `partition` after the record at `offset` failed.
    ///
    /// Nothing after `offset` is delivered until the record is redelivered and
    /// succeeds. The redelivery is scheduled according to the retry policy.
    pub fn on_failure(
        &self,
        partition: &Partition,
        offset: i64,
        error: &ConsumerError,
    ) -> Result<(), ConsumerError> {
        self.ledger.set_halted(partition, true)?;

        let attempts = match self.phase(partition) {
            RetryPhase::Halted {
                attempts,
                failed_offset,
                ..
            }
            | RetryPhase::Resuming {
                attempts,
                failed_offset,
            } if failed_offset == offset => attempts.saturating_add(1),
            _ => 1,
        };
        let delay = self.retry_policy.retry_interval(attempts);
        let now = Instant::now();
        let retry_at = now
            .checked_add(delay)
            .unwrap_or_else(|| now + MAX_RETRY_DELAY);

        self.phases.insert(
            partition.clone(),
            RetryPhase::Halted {
                attempts,
                failed_offset: offset,
                retry_at,
            },
        );

        warn!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            offset = offset,
            attempts = attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = ?error,
            "Processing failed - halting partition until the record is redelivered"
        );
        metrics::counter!(
            PARTITION_HALTS,
            "topic" => partition.topic().to_string(),
            "partition" => partition.partition_number().to_string(),
            "error" => error.kind()
        )
        .increment(1);
        self.report_halted();

        Ok(())
    }

    /// Called once per poll cycle before fetching.
    ///
    /// Every halted partition whose backoff elapsed is rewound to its resume
    /// offset and re-seeked, so the failed record comes back on this fetch.
    /// Returns the partitions that are still backing off; those must not be
    /// fetched this cycle.
    pub async fn prepare_poll(&self, broker: &dyn BrokerClient) -> HashSet<Partition> {
        let now = Instant::now();
        let mut backing_off = HashSet::new();
        let mut due = Vec::new();

        // Collect first so no map guard is held across the seek
        for entry in self.phases.iter() {
            if let RetryPhase::Halted {
                attempts,
                failed_offset,
                retry_at,
            } = *entry.value()
            {
                if retry_at <= now {
                    due.push((entry.key().clone(), attempts, failed_offset));
                } else {
                    backing_off.insert(entry.key().clone());
                }
            }
        }

        for (partition, attempts, failed_offset) in due {
            let Some(resume_offset) = self.ledger.rewind(&partition) else {
                // revoked while halted
                self.phases.remove(&partition);
                continue;
            };

            if let Err(e) = broker.seek(&partition, resume_offset).await {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    resume_offset = resume_offset,
                    error = ?e,
                    "Failed to seek halted partition - retrying next poll"
                );
                metrics::counter!(CONSUMER_BROKER_ERRORS, "operation" => "seek").increment(1);
                backing_off.insert(partition);
                continue;
            }

            if self.ledger.set_halted(&partition, false).is_err() {
                self.phases.remove(&partition);
                continue;
            }
            self.phases.insert(
                partition.clone(),
                RetryPhase::Resuming {
                    attempts,
                    failed_offset,
                },
            );

            info!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                resume_offset = resume_offset,
                failed_offset = failed_offset,
                attempts = attempts,
                "Resuming halted partition for redelivery"
            );
            metrics::counter!(
                PARTITION_RESUMES,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition_number().to_string()
            )
            .increment(1);
        }

        self.report_halted();
        backing_off
    }

    /// Record a successful processing call. Once the previously failing
    /// record succeeds the partition is back to normal running.
    pub fn on_success(&self, partition: &Partition, offset: i64) {
        let Some(mut phase) = self.phases.get_mut(partition) else {
            return;
        };

        if let RetryPhase::Resuming {
            attempts,
            failed_offset,
        } = *phase
        {
            if offset >= failed_offset {
                *phase = RetryPhase::Running;
                info!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = failed_offset,
                    failed_attempts = attempts,
                    "Redelivered record processed - partition running again"
                );
                metrics::histogram!(REDELIVERY_ATTEMPTS).record(f64::from(attempts + 1));
            }
        }
    }

    /// Drop retry state of a revoked partition
    pub fn forget(&self, partition: &Partition) {
        self.phases.remove(partition);
        self.report_halted();
    }

    pub fn clear_all(&self) {
        self.phases.clear();
        self.report_halted();
    }

    pub fn phase(&self, partition: &Partition) -> RetryPhase {
        self.phases
            .get(partition)
            .map(|p| *p)
            .unwrap_or(RetryPhase::Running)
    }

    /// Failed attempts of the record currently blocking `partition`
    pub fn attempts(&self, partition: &Partition) -> u32 {
        match self.phase(partition) {
            RetryPhase::Running => 0,
            RetryPhase::Halted { attempts, .. } | RetryPhase::Resuming { attempts, .. } => {
                attempts
            }
        }
    }

    pub fn halted_count(&self) -> usize {
        self.phases
            .iter()
            .filter(|e| matches!(e.value(), RetryPhase::Halted { .. }))
            .count()
    }

    fn report_halted(&self) {
        metrics::gauge!(PARTITIONS_HALTED).set(self.halted_count() as f64);
    }
}
