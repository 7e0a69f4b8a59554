//! # Kafka Connectivity Library
//!
//! Bridges a Kafka-compatible broker and an internal messaging sink in both directions.
//!
//! ## Consumption
//!
//! Records polled from the broker flow through a bounded queue into a consumer stream,
//! which transforms each record into an [`ExternalMessage`] and hands it to a
//! [`MessageSink`]. Two delivery modes exist:
//! - **At most once**: offsets are auto-committed by the broker client, the stream never
//!   waits for the sink to settle a message
//! - **At least once**: a record's offset is committed only after the sink acknowledged it,
//!   and commits per partition never move backwards
//!
//! Streams are supervised by a [`RestartableConsumerStream`], which replaces streams that
//! failed with a transient error after an exponential backoff delay, and owned by a
//! [`KafkaConsumerActor`] that can be stopped gracefully.
//!
//! ```text
//! Broker → poller → RecordQueue → ConsumerStream → Transformer → MessageSink
//!                                       ↑                            │
//!                                  commit offsets ←── acknowledgement ┘
//! ```
//!
//! ## Publication
//!
//! [`KafkaPublisher`] parses each message's address into a [`PublishTarget`]
//! (`topic`, `topic/key` or `topic#partition`), queues the send and answers the requester
//! with an [`Acknowledgement`] once the broker confirmed or rejected the record.
//!
//! ## Usage Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kafka_connectivity::*;
//!
//! # async fn example(client_config: rdkafka::ClientConfig) -> Result<()> {
//! let settings = ConnectivitySettings::load(None)?;
//! let consumer_data = Arc::new(ConsumerData::new("events", 0));
//! let (sink, mut messages, _failures) = ChannelSink::new(64);
//!
//! let transformer = KafkaMessageTransformer::new(consumer_data.clone(), None, Arc::new(NoopMonitor));
//! let context = StreamContext::new(transformer, Arc::new(sink), settings.consumer.stream_settings());
//! let client_factory = RdKafkaConsumerClientFactory::new(
//!     client_config,
//!     vec!["events".to_string()],
//!     settings.consumer.delivery_mode,
//! );
//! let factory = KafkaConsumerStreamFactory::new(
//!     Arc::new(client_factory),
//!     context,
//!     settings.consumer.delivery_mode,
//!     settings.consumer.queue_capacity,
//! );
//!
//! let consumer = KafkaConsumerActor::spawn(
//!     consumer_data,
//!     Arc::new(factory),
//!     settings.consumer.restart_backoff()?,
//! );
//!
//! while let Some(message) = messages.recv().await {
//!     // forward message.message() ...
//!     message.acknowledge();
//! }
//! consumer.graceful_stop(std::time::Duration::from_secs(10)).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod delivery;
pub mod enforcement;
pub mod error;
pub mod headers;
pub mod message;
pub mod metrics;
pub mod offsets;
pub mod publisher;
pub mod sink;
pub mod source;
pub mod stream;
pub mod supervisor;
pub mod target;
pub mod transformer;

pub use config::{ConnectivitySettings, ConsumerSettings, ProducerSettings};
pub use consumer::{
    ConsumerActorState, ConsumerData, ConsumerStatus, GracefulStopAck, KafkaConsumerActor,
    KafkaConsumerActorHandle,
};
pub use delivery::{
    AcknowledgeableMessage, CommitHandle, CommittableTransformationResult, SinkAck,
    TransformationError, TransformationErrorKind, TransformationResult,
};
pub use enforcement::{EnforcementError, EnforcementFilter};
pub use error::{ConfigurationError, KafkaConnectivityError, Result};
pub use headers::MessageHeaders;
pub use message::{ExternalMessage, KafkaRecord, TopicPartition};
pub use metrics::{ConnectivityMetrics, InboundMonitor, MonitorError, NoopMonitor, OutboundMonitor};
pub use offsets::PartitionOffsetTracker;
pub use publisher::{
    Acknowledgement, AcknowledgementRouter, KafkaPublisher, OutboundMessage, OutboundSignal,
    ProducerRecord, PublisherSettings, RdKafkaSendProducer, RecordMetadata, SendError,
    SendProducer,
};
pub use sink::{ChannelSink, MessageSink};
pub use source::{
    record_queue, ConsumerClient, ConsumerClientFactory, OfferResult, RdKafkaConsumerClient,
    RdKafkaConsumerClientFactory, RecordQueue, RecordReceiver,
};
pub use stream::{
    AtLeastOnceConsumerStream, AtMostOnceConsumerStream, ConsumerStream, ConsumerStreamFactory,
    DeliveryMode, KafkaConsumerStreamFactory, StreamContext, StreamOutcome, StreamSettings,
    StreamSource, STAGING_SLOTS,
};
pub use supervisor::{RestartableConsumerStream, SupervisorState};
pub use target::PublishTarget;
pub use transformer::KafkaMessageTransformer;
