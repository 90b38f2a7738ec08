use std::time::Duration;

use anyhow::Context;
use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::kafka::{ConsumerConfigBuilder, OffsetReset};
use crate::partition_worker::PartitionWorkerConfig;
use crate::retry::RetryPolicy;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "kafka-redelivery")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "inbound")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "300000")]
    pub kafka_max_poll_interval_ms: u32,

    #[envconfig(default = "60000")]
    pub kafka_session_timeout_ms: u32,

    // Poll cycle configuration
    #[envconfig(default = "500")]
    pub max_poll_records: usize,

    #[envconfig(default = "1000")]
    pub poll_timeout_ms: u64,

    #[envconfig(default = "4")]
    pub partition_channel_buffer_size: usize,

    // Redelivery backoff
    #[envconfig(default = "2")]
    pub retry_backoff_coefficient: u32,

    #[envconfig(default = "100")]
    pub retry_initial_interval_ms: u64,

    #[envconfig(default = "30000")]
    pub retry_maximum_interval_ms: u64,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::build(
            self.retry_backoff_coefficient,
            Duration::from_millis(self.retry_initial_interval_ms),
        )
        .maximum_interval(Duration::from_millis(self.retry_maximum_interval_ms))
        .provide()
    }

    pub fn offset_reset(&self) -> anyhow::Result<OffsetReset> {
        self.kafka_consumer_offset_reset
            .parse()
            .context("Invalid KAFKA_CONSUMER_OFFSET_RESET")
    }

    /// librdkafka settings for the group consumer
    pub fn to_client_config(&self, offset_reset: OffsetReset) -> ClientConfig {
        ConsumerConfigBuilder::for_batch_consumer(&self.kafka_hosts, &self.kafka_consumer_group)
            .with_tls(self.kafka_tls)
            .with_offset_reset(offset_reset)
            .with_max_poll_interval_ms(self.kafka_max_poll_interval_ms)
            .with_session_timeout_ms(self.kafka_session_timeout_ms)
            .build()
    }

    /// Convert to the engine's ConsumerConfig
    pub fn to_consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig::new(
            self.kafka_consumer_group.clone(),
            vec![self.kafka_consumer_topic.clone()],
        )
        .with_max_poll_records(self.max_poll_records)
        .with_poll_timeout(self.poll_timeout())
        .with_retry_policy(self.retry_policy())
        .with_channel_buffer_size(self.partition_channel_buffer_size)
    }
}

/// Settings of one `RedeliveryConsumer`, independent of where they came from
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub topics: Vec<String>,
    /// Upper bound on records returned by one fetch
    pub max_poll_records: usize,
    pub poll_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub worker: PartitionWorkerConfig,
}

impl ConsumerConfig {
    pub fn new(group_id: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            group_id: group_id.into(),
            topics,
            max_poll_records: 500,
            poll_timeout: Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
            worker: PartitionWorkerConfig::default(),
        }
    }

    pub fn with_max_poll_records(mut self, max_poll_records: usize) -> Self {
        self.max_poll_records = max_poll_records.max(1);
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_channel_buffer_size(mut self, size: usize) -> Self {
        self.worker.channel_buffer_size = size.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_from_empty_environment() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.kafka_hosts, "localhost:9092");
        assert_eq!(config.kafka_consumer_group, "kafka-redelivery");
        assert_eq!(config.kafka_consumer_offset_reset, "earliest");
        assert!(!config.kafka_tls);
        assert_eq!(config.max_poll_records, 500);
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_to_consumer_config() {
        let env = HashMap::from([
            ("KAFKA_CONSUMER_GROUP".to_string(), "lost-messages".to_string()),
            ("KAFKA_CONSUMER_TOPIC".to_string(), "inbound-topic".to_string()),
            ("MAX_POLL_RECORDS".to_string(), "5".to_string()),
            ("POLL_TIMEOUT_MS".to_string(), "250".to_string()),
            ("RETRY_INITIAL_INTERVAL_MS".to_string(), "10".to_string()),
            ("RETRY_MAXIMUM_INTERVAL_MS".to_string(), "40".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();
        let consumer = config.to_consumer_config();

        assert_eq!(consumer.group_id, "lost-messages");
        assert_eq!(consumer.topics, vec!["inbound-topic".to_string()]);
        assert_eq!(consumer.max_poll_records, 5);
        assert_eq!(consumer.poll_timeout, Duration::from_millis(250));
        assert_eq!(
            consumer.retry_policy.retry_interval(1),
            Duration::from_millis(10)
        );
        assert_eq!(
            consumer.retry_policy.retry_interval(10),
            Duration::from_millis(40)
        );
    }

    #[test]
    fn test_to_client_config() {
        let env = HashMap::from([
            ("KAFKA_HOSTS".to_string(), "kafka:9092".to_string()),
            ("KAFKA_CONSUMER_OFFSET_RESET".to_string(), "latest".to_string()),
            ("KAFKA_MAX_POLL_INTERVAL_MS".to_string(), "45000".to_string()),
            ("KAFKA_SESSION_TIMEOUT_MS".to_string(), "12000".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();
        let offset_reset = config.offset_reset().unwrap();
        let client = config.to_client_config(offset_reset);

        assert_eq!(offset_reset, OffsetReset::Latest);
        assert_eq!(client.get("bootstrap.servers"), Some("kafka:9092"));
        assert_eq!(client.get("group.id"), Some("kafka-redelivery"));
        assert_eq!(client.get("auto.offset.reset"), Some("latest"));
        assert_eq!(client.get("max.poll.interval.ms"), Some("45000"));
        assert_eq!(client.get("session.timeout.ms"), Some("12000"));
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
    }

    #[test]
    fn test_invalid_offset_reset_is_rejected() {
        let env = HashMap::from([(
            "KAFKA_CONSUMER_OFFSET_RESET".to_string(),
            "sideways".to_string(),
        )]);
        let config = Config::init_from_hashmap(&env).unwrap();
        assert!(config.offset_reset().is_err());
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let env = HashMap::from([("MAX_POLL_RECORDS".to_string(), "many".to_string())]);
        assert!(Config::init_from_hashmap(&env).is_err());
    }

    #[test]
    fn test_zero_poll_records_is_clamped() {
        let config = ConsumerConfig::new("group", vec!["topic".to_string()]).with_max_poll_records(0);
        assert_eq!(config.max_poll_records, 1);
    }
}
