use std::time::Duration;

use common_health::HealthHandle;
use rdkafka::error::KafkaError;
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::KafkaConfig;

#[derive(Error, Debug)]
pub enum ProduceError {
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to produce to kafka: {0}")]
    Kafka(#[from] KafkaError),
    #[error("broker acknowledgement timed out")]
    AckTimedOut,
}

impl ProduceError {
    /// Oversize payloads are a property of the message, not the broker
    /// connection, so they're handled as a drop rather than retried.
    pub fn is_message_too_large(&self) -> bool {
        matches!(
            self,
            ProduceError::Kafka(error)
                if matches!(
                    error.rdkafka_error_code(),
                    Some(RDKafkaErrorCode::MessageSizeTooLarge)
                )
        )
    }
}

// Bridges librdkafka's stats callback to the health registry: the
// callback firing at all proves the producer's internal loop is alive.
struct StatsContext {
    liveness: HealthHandle,
}

impl rdkafka::ClientContext for StatsContext {
    fn stats(&self, _: rdkafka::Statistics) {
        self.liveness.report_healthy_blocking();
    }
}

/// A pending broker acknowledgement for one enqueued record. The batch
/// loop collects these and awaits them all before storing its offset
/// bookmark.
pub struct DeliveryHandle(DeliveryFuture);

impl DeliveryHandle {
    pub async fn wait(self) -> Result<(), ProduceError> {
        match self.0.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((error, _))) => Err(error.into()),
            // Cancelled after exhausting librdkafka's internal retries
            Err(_) => Err(ProduceError::AckTimedOut),
        }
    }
}

/// The shared producer for every downstream topic. Emission is
/// two-phase: `enqueue` serializes and hands the record to librdkafka
/// synchronously, rejecting oversize payloads on the spot, and the
/// returned handle resolves when the broker acknowledges the write.
pub struct EventProducer {
    inner: FutureProducer<StatsContext>,
}

impl EventProducer {
    pub async fn new(config: &KafkaConfig, liveness: HealthHandle) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "compression.codec",
                config.kafka_compression_codec.to_owned(),
            )
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            )
            .set(
                "queue.buffering.max.messages",
                config.kafka_producer_queue_messages.to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let inner: FutureProducer<StatsContext> =
            client_config.create_with_context(StatsContext { liveness })?;

        // Fail startup, not the first batch, when the brokers are
        // unreachable
        let metadata = inner.client().fetch_metadata(None, Duration::from_secs(15))?;
        info!(
            "Connected to Kafka brokers, {} topics visible",
            metadata.topics().len()
        );

        Ok(Self { inner })
    }

    pub fn enqueue<T>(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &T,
    ) -> Result<DeliveryHandle, ProduceError>
    where
        T: Serialize,
    {
        let payload = serde_json::to_string(payload)?;

        match self.inner.send_result(FutureRecord {
            topic,
            payload: Some(&payload),
            partition: None,
            key,
            timestamp: None,
            headers: None,
        }) {
            Ok(future) => Ok(DeliveryHandle(future)),
            Err((error, _)) => Err(error.into()),
        }
    }

    /// Block until the in-flight queue drains or the timeout passes.
    pub fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.inner.flush(timeout)
    }
}
