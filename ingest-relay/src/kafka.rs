//! Kafka producer and consumer plumbing.
//!
//! Both sides authenticate with SASL (SCRAM-SHA-512 by default) over TLS.

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::consumer::MessageSource;
use crate::errors::RelayError;
use crate::record::ActivityRecord;
use crate::sink::RecordSink;
use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;

/// Connection settings shared by the producer and the consumer.
pub fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.brokers.join(","))
        .set("security.protocol", &config.security_protocol);

    if !config.username.is_empty() {
        client
            .set("sasl.mechanisms", &config.sasl_mechanism)
            .set("sasl.username", &config.username)
            .set("sasl.password", &config.password);
    }

    client
}

/// Publishes one JSON message per record, keyed by activity id.
pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(config: &KafkaConfig) -> Result<Self, RelayError> {
        let producer: FutureProducer = client_config(config)
            .set("message.timeout.ms", config.produce_timeout_ms.to_string())
            .create()?;

        Ok(Self {
            producer,
            topic: config.topic.clone(),
            timeout: config.produce_timeout(),
        })
    }
}

#[async_trait]
impl RecordSink for KafkaPublisher {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn publish(&self, record: &ActivityRecord) -> Result<(), RelayError> {
        let payload = serde_json::to_vec(record).map_err(RelayError::Serialization)?;
        let message = FutureRecord::to(&self.topic)
            .key(record.activity_uuid.as_str())
            .payload(&payload);

        self.producer
            .send(message, self.timeout)
            .await
            .map_err(|(e, _message)| RelayError::Queue(e))?;

        tracing::debug!(
            activity_uuid = %record.activity_uuid,
            topic = %self.topic,
            "Published record"
        );
        Ok(())
    }
}

/// Reads raw messages from the topic as part of a consumer group.
///
/// Offsets are committed by the client's auto-commit.
pub struct KafkaSource {
    consumer: StreamConsumer,
}

impl KafkaSource {
    pub fn new(config: &KafkaConfig, consumer_config: &ConsumerConfig) -> Result<Self, RelayError> {
        let consumer: StreamConsumer = client_config(config)
            .set("group.id", &consumer_config.group_id)
            .set("auto.offset.reset", &consumer_config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .create()?;

        consumer.subscribe(&[config.topic.as_str()])?;
        tracing::info!(
            topic = %config.topic,
            group_id = %consumer_config.group_id,
            "Subscribed to topic"
        );

        Ok(Self { consumer })
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn next_message(&self) -> Result<Option<Vec<u8>>, RelayError> {
        let message = self.consumer.recv().await?;
        Ok(message.payload().map(<[u8]>::to_vec))
    }
}
