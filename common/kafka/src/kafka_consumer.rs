use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
    ClientConfig, Message,
};

use crate::config::{ConsumerConfig, KafkaConfig};

/// A consumer-group member pulling one topic in batches. Offsets are
/// never stored on the recv path: each batch hands back a bookmark that
/// the caller stores once every downstream acknowledgement for the
/// batch has settled, which makes redelivery the failure mode instead
/// of loss.
#[derive(Clone)]
pub struct BatchConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer has been dropped")]
    Gone,
}

/// One raw message as pulled off the bus. Decoding is the pipeline's
/// job, so parse failures stay per-event instead of poisoning the pull
/// loop, and the raw bytes remain available for the DLQ.
pub struct ReceivedMessage {
    pub payload: Vec<u8>,
    pub partition: i32,
    pub offset: i64,
}

/// The highest offset seen per partition across one batch.
pub struct BatchBookmark {
    handle: Weak<Inner>,
    high_water: HashMap<i32, i64>,
}

impl BatchBookmark {
    fn record(&mut self, partition: i32, offset: i64) {
        let entry = self.high_water.entry(partition).or_insert(offset);
        if *entry < offset {
            *entry = offset;
        }
    }

    /// Mark the whole batch as processed. Partitions revoked by a
    /// rebalance before this point simply replay from the last stored
    /// bookmark on their new owner.
    pub fn store(self) -> Result<(), ConsumerError> {
        let inner = self.handle.upgrade().ok_or(ConsumerError::Gone)?;
        for (partition, offset) in self.high_water {
            inner.consumer.store_offset(&inner.topic, partition, offset)?;
        }
        Ok(())
    }
}

impl BatchConsumer {
    pub fn new(
        common_config: KafkaConfig,
        consumer_config: ConsumerConfig,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &common_config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            // Offsets move through BatchBookmark::store, nothing else
            .set("enable.auto.offset.store", "false");

        if common_config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

        Ok(Self {
            inner: Arc::new(Inner {
                consumer,
                topic: consumer_config.kafka_consumer_topic,
            }),
        })
    }

    /// Pull up to `max` messages, waiting at most `wait` overall. An
    /// empty result just means a quiet topic. Tombstones (empty
    /// payloads) are bookmarked and skipped.
    pub async fn recv_batch(
        &self,
        max: usize,
        wait: Duration,
    ) -> Result<(Vec<ReceivedMessage>, BatchBookmark), ConsumerError> {
        let mut bookmark = BatchBookmark {
            handle: Arc::downgrade(&self.inner),
            high_water: HashMap::new(),
        };
        let mut messages = Vec::with_capacity(max);
        let deadline = tokio::time::Instant::now() + wait;

        while messages.len() < max {
            let message =
                match tokio::time::timeout_at(deadline, self.inner.consumer.recv()).await {
                    Ok(Ok(message)) => message,
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => break, // deadline reached
                };

            bookmark.record(message.partition(), message.offset());

            let Some(payload) = message.payload() else {
                continue;
            };
            messages.push(ReceivedMessage {
                payload: payload.to_vec(),
                partition: message.partition(),
                offset: message.offset(),
            });
        }

        Ok((messages, bookmark))
    }
}
