//! At-least-once Kafka consumption with manual commits and break-on-first-error
//! redelivery.
//!
//! A record whose processing fails is never skipped: its partition stops
//! delivering for the rest of the poll cycle, is re-seeked to the first
//! uncommitted offset after a backoff, and the record is delivered again until
//! processing succeeds.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types with a cause chain, use
//! formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}`: full chain on one line.
//! - **Structured field:** `error = ?e`: full chain with `Caused by:` sections.
//!
//! When constructing errors, use `.context()` / `.with_context()` so the
//! original error remains the source.

pub mod client;
pub mod commit;
pub mod config;
pub mod consumer;
pub mod controller;
pub mod error;
pub mod kafka;
pub mod ledger;
pub mod metrics_consts;
pub mod partition_worker;
pub mod pipeline;
pub mod processor;
pub mod retry;
pub mod test_utils;
pub mod types;

// Re-export commonly used types for convenience
pub use client::BrokerClient;
pub use commit::CommitHandle;
pub use consumer::RedeliveryConsumer;
pub use error::ConsumerError;
pub use processor::RecordProcessor;
pub use types::{Partition, Record};
