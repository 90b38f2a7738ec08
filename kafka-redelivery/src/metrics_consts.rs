// ==== Poll loop metrics ====
/// Counter for poll cycles run by the consumer loop
pub const CONSUMER_POLL_CYCLES: &str = "redelivery_consumer_poll_cycles_total";

/// Histogram for records returned per fetch
pub const CONSUMER_BATCH_SIZE: &str = "redelivery_consumer_batch_size";

/// Gauge for partitions currently assigned to this consumer
pub const CONSUMER_ASSIGNED_PARTITIONS: &str = "redelivery_consumer_assigned_partitions";

/// Counter for broker errors hit by the poll loop
pub const CONSUMER_BROKER_ERRORS: &str = "redelivery_consumer_broker_errors_total";

// ==== Delivery metrics ====
/// Counter for records handed to the processing function
pub const RECORDS_DELIVERED: &str = "redelivery_records_delivered_total";

/// Counter for records skipped because their partition was halted
pub const RECORDS_SKIPPED_HALTED: &str = "redelivery_records_skipped_halted_total";

/// Histogram for processing function duration
pub const RECORD_PROCESSING_DURATION: &str = "redelivery_record_processing_duration_seconds";

// ==== Break-on-first-error metrics ====
/// Counter for processing failures that halted a partition
pub const PARTITION_HALTS: &str = "redelivery_partition_halts_total";

/// Counter for halted partitions re-seeked for redelivery
pub const PARTITION_RESUMES: &str = "redelivery_partition_resumes_total";

/// Gauge for partitions currently halted
pub const PARTITIONS_HALTED: &str = "redelivery_partitions_halted";

/// Histogram for attempts needed before a failing record succeeded
pub const REDELIVERY_ATTEMPTS: &str = "redelivery_attempts_until_success";

// ==== Commit metrics ====
/// Counter for commit attempts, labeled by outcome
pub const COMMITS: &str = "redelivery_commits_total";

/// Gauge for the last committed offset per partition
pub const PARTITION_LAST_COMMITTED_OFFSET: &str = "redelivery_partition_last_committed_offset";

/// Counter for sequence violations detected by the offset ledger
pub const LEDGER_SEQUENCE_VIOLATIONS: &str = "redelivery_ledger_sequence_violations_total";

// ==== Kafka adapter metrics ====
/// Counter for rebalance callbacks, labeled by event type
pub const KAFKA_REBALANCE_EVENTS: &str = "redelivery_kafka_rebalance_events_total";

/// Counter for records fetched for partitions the consumer did not ask for
pub const KAFKA_UNREQUESTED_RECORDS: &str = "redelivery_kafka_unrequested_records_total";
