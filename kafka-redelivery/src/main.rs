use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{routing::get, Router};
use futures::future::ready;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use kafka_redelivery::config::Config;
use kafka_redelivery::kafka::RdKafkaBroker;
use kafka_redelivery::{CommitHandle, ConsumerError, Record, RecordProcessor, RedeliveryConsumer};

/// Logs every record and commits it once processing returned
struct LoggingProcessor;

#[async_trait]
impl RecordProcessor for LoggingProcessor {
    async fn process(&self, record: &Record, _commit: &CommitHandle) -> Result<()> {
        info!(
            topic = record.partition().topic(),
            partition = record.partition().partition_number(),
            offset = record.offset(),
            key = record.key_str().unwrap_or_default(),
            value = record.value_str().unwrap_or_default(),
            "Received record"
        );
        Ok(())
    }

    async fn on_processed(&self, _record: &Record, commit: CommitHandle) -> Result<(), ConsumerError> {
        commit.commit_sync().await
    }
}

fn setup_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")
}

fn start_server(config: &Config, recorder_handle: PrometheusHandle) -> JoinHandle<()> {
    let router = Router::new()
        .route("/", get(|| async { "kafka redelivery consumer" }))
        .route("/_readiness", get(|| async { "ok" }))
        .route("/_liveness", get(|| ready("ok")))
        .route("/metrics", get(move || ready(recorder_handle.render())));

    let bind = config.bind_address();

    tokio::task::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(bind = %bind, error = ?e, "Failed to bind metrics server");
                return;
            }
        };
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = ?e, "Metrics server stopped");
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_filter(EnvFilter::from_default_env())
        .boxed();
    tracing_subscriber::registry().with(log_layer).init();

    info!("Starting Kafka redelivery consumer");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    info!("Configuration loaded: {:?}", config);

    let server_handle = start_server(&config, setup_metrics()?);
    info!("Started metrics server on {}", config.bind_address());

    let offset_reset = config.offset_reset()?;
    let consumer_config = config.to_consumer_config();
    let client_config = config.to_client_config(offset_reset);

    let broker = RdKafkaBroker::new(&client_config, &consumer_config, offset_reset)
        .context("Failed to create Kafka consumer. Check your Kafka connection settings.")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let consumer = RedeliveryConsumer::new(
        Arc::new(broker),
        Arc::new(LoggingProcessor),
        consumer_config,
        shutdown_rx,
    );
    let consumer_handle = tokio::spawn(consumer.start_consumption());

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received ctrl-c"),
            Err(e) => error!(error = ?e, "Failed to listen for ctrl-c"),
        }
        if shutdown_tx.send(()).is_err() {
            info!("Consumer already stopped");
        }
    });

    let result = consumer_handle.await.context("Consumer task panicked")?;
    server_handle.abort();
    result.context("Consumer stopped with a fatal error")
}
