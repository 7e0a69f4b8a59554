use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use http::StatusCode;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use thiserror::Error;
use tracing::error;

use super::acks::RecordMetadata;
use crate::error::{KafkaConnectivityError, Result};
use crate::headers::{self, MessageHeaders};
use crate::message::ExternalMessage;
use crate::target::PublishTarget;

/// Send failure, classified by whether resubmitting could help
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Broker or connectivity problem
    #[error("Failed to publish message: {0}")]
    Retryable(String),

    /// The broker will never accept this record
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

impl SendError {
    pub fn status(&self) -> StatusCode {
        match self {
            SendError::Retryable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SendError::InvalidRecord(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<&KafkaError> for SendError {
    fn from(err: &KafkaError) -> Self {
        let invalid = matches!(
            err.rdkafka_error_code(),
            Some(
                RDKafkaErrorCode::InvalidMessage
                    | RDKafkaErrorCode::MessageSizeTooLarge
                    | RDKafkaErrorCode::InvalidMessageSize
                    | RDKafkaErrorCode::InvalidRecord
                    | RDKafkaErrorCode::InvalidTopic
                    | RDKafkaErrorCode::UnknownPartition
            )
        );

        if invalid {
            SendError::InvalidRecord(err.to_string())
        } else {
            SendError::Retryable(err.to_string())
        }
    }
}

/// Record ready to be handed to the broker
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord {
    pub topic: String,
    pub key: Option<String>,
    pub partition: Option<i32>,
    pub payload: Option<Vec<u8>>,
    pub headers: MessageHeaders,
}

impl ProducerRecord {
    /// Broker metadata headers of consumed messages are not forwarded
    pub fn new(target: &PublishTarget, message: &ExternalMessage) -> Self {
        let headers = message
            .headers
            .iter()
            .filter(|(name, _)| {
                !matches!(
                    name.as_str(),
                    headers::KAFKA_TOPIC | headers::KAFKA_KEY | headers::KAFKA_TIMESTAMP
                )
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Self {
            topic: target.topic.clone(),
            key: target.key.clone(),
            partition: target.partition,
            payload: message.payload_bytes().map(<[u8]>::to_vec),
            headers,
        }
    }
}

#[async_trait]
pub trait SendProducer: Send + Sync {
    async fn send(&self, record: ProducerRecord) -> std::result::Result<RecordMetadata, SendError>;
}

pub struct RdKafkaSendProducer {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl RdKafkaSendProducer {
    pub fn new(client_config: &ClientConfig, send_timeout: Duration) -> Result<Self> {
        let producer: FutureProducer = client_config.create().map_err(|e| {
            error!("Failed to create Kafka producer: {}", e);
            KafkaConnectivityError::Kafka(e)
        })?;

        Ok(Self {
            producer,
            send_timeout,
        })
    }
}

#[async_trait]
impl SendProducer for RdKafkaSendProducer {
    async fn send(&self, record: ProducerRecord) -> std::result::Result<RecordMetadata, SendError> {
        let timestamp = Utc::now().timestamp_millis();

        let mut kafka_headers = OwnedHeaders::new_with_capacity(record.headers.len());
        for (key, value) in &record.headers {
            kafka_headers = kafka_headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_bytes()),
            });
        }

        let mut future_record: FutureRecord<'_, str, [u8]> = FutureRecord::to(&record.topic)
            .timestamp(timestamp)
            .headers(kafka_headers);
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }
        if let Some(payload) = record.payload.as_deref() {
            future_record = future_record.payload(payload);
        }
        if let Some(partition) = record.partition {
            future_record = future_record.partition(partition);
        }

        let (partition, offset) = self
            .producer
            .send(future_record, self.send_timeout)
            .await
            .map_err(|(err, _)| SendError::from(&err))?;

        Ok(RecordMetadata {
            timestamp: Some(timestamp),
            serialized_key_size: record.key.as_ref().map_or(0, String::len),
            serialized_value_size: record.payload.as_ref().map_or(0, Vec::len),
            topic: record.topic,
            partition,
            offset,
        })
    }
}
