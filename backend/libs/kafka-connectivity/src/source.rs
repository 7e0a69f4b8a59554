//! Broker-facing side of the consumer streams: the bounded record queue and the client seam.

use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::Offset;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{KafkaConnectivityError, Result};
use crate::message::{KafkaRecord, TopicPartition};
use crate::stream::DeliveryMode;

/// Outcome of a non-blocking offer to the record queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferResult {
    Enqueued,
    /// The queue is full
    Dropped,
    /// The consuming stream has ended
    QueueClosed,
}

/// Producer side of the bounded queue feeding a consumer stream
#[derive(Debug, Clone)]
pub struct RecordQueue {
    sender: mpsc::Sender<KafkaRecord>,
}

/// Consumer side of the bounded record queue
#[derive(Debug)]
pub struct RecordReceiver {
    receiver: mpsc::Receiver<KafkaRecord>,
}

/// Bounded queue between the poller and a stream. Holds at least one record.
pub fn record_queue(capacity: usize) -> (RecordQueue, RecordReceiver) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (RecordQueue { sender }, RecordReceiver { receiver })
}

impl RecordQueue {
    pub fn offer(&self, record: KafkaRecord) -> OfferResult {
        match self.sender.try_send(record) {
            Ok(()) => OfferResult::Enqueued,
            Err(mpsc::error::TrySendError::Full(record)) => {
                debug!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    "Record queue full"
                );
                OfferResult::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => OfferResult::QueueClosed,
        }
    }

    /// Wait for a free slot, then enqueue
    pub async fn offer_when_ready(&self, record: KafkaRecord) -> OfferResult {
        match self.sender.send(record).await {
            Ok(()) => OfferResult::Enqueued,
            Err(_) => OfferResult::QueueClosed,
        }
    }

    /// Free slots
    pub fn available(&self) -> usize {
        self.sender.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<KafkaRecord> {
        &self.sender
    }
}

impl RecordReceiver {
    pub(crate) async fn recv(&mut self) -> Option<KafkaRecord> {
        self.receiver.recv().await
    }

    /// Stop accepting records; already queued ones can still be received
    pub(crate) fn close(&mut self) {
        self.receiver.close();
    }
}

/// Connected broker consumer shared by the poller and the committing stream
#[async_trait]
pub trait ConsumerClient: Send + Sync {
    async fn poll(&self) -> Result<KafkaRecord>;

    /// Commit the next offsets to consume for the given partitions
    fn commit(&self, offsets: &[(TopicPartition, i64)]) -> Result<()>;

    /// Leave the consumer group; the client is not used afterwards
    fn close(&self);
}

#[async_trait]
pub trait ConsumerClientFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ConsumerClient>>;
}

/// Creates subscribed [`StreamConsumer`]s from an opaque client configuration
#[derive(Clone)]
pub struct RdKafkaConsumerClientFactory {
    client_config: ClientConfig,
    topics: Vec<String>,
    delivery_mode: DeliveryMode,
}

impl RdKafkaConsumerClientFactory {
    pub fn new(
        client_config: ClientConfig,
        topics: Vec<String>,
        delivery_mode: DeliveryMode,
    ) -> Self {
        Self {
            client_config,
            topics,
            delivery_mode,
        }
    }
}

#[async_trait]
impl ConsumerClientFactory for RdKafkaConsumerClientFactory {
    async fn connect(&self) -> Result<Arc<dyn ConsumerClient>> {
        let auto_commit = match self.delivery_mode {
            DeliveryMode::AtMostOnce => "true",
            DeliveryMode::AtLeastOnce => "false",
        };

        let consumer: StreamConsumer = self
            .client_config
            .clone()
            .set("enable.auto.commit", auto_commit)
            .create()
            .map_err(|e| {
                error!("Failed to create Kafka consumer: {}", e);
                KafkaConnectivityError::StreamStart(e.to_string())
            })?;

        let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics).map_err(|e| {
            error!("Failed to subscribe to topics: {}", e);
            KafkaConnectivityError::StreamStart(e.to_string())
        })?;

        info!(topics = ?self.topics, mode = ?self.delivery_mode, "Kafka consumer subscribed");
        Ok(Arc::new(RdKafkaConsumerClient { consumer }))
    }
}

pub struct RdKafkaConsumerClient {
    consumer: StreamConsumer,
}

#[async_trait]
impl ConsumerClient for RdKafkaConsumerClient {
    async fn poll(&self) -> Result<KafkaRecord> {
        let message = self.consumer.recv().await?;
        Ok(KafkaRecord::from_message(&message))
    }

    fn commit(&self, offsets: &[(TopicPartition, i64)]) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        for (topic_partition, offset) in offsets {
            tpl.add_partition_offset(
                &topic_partition.topic,
                topic_partition.partition,
                Offset::Offset(*offset),
            )?;
        }

        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| KafkaConnectivityError::OffsetCommit(e.to_string()))
    }

    fn close(&self) {
        self.consumer.unsubscribe();
    }
}

/// Move records from the client into the queue until shutdown.
///
/// Waits for a free queue slot before polling, so broker records are never dropped here.
/// Returns the client error that ended polling, if any.
pub(crate) fn spawn_poller(
    client: Arc<dyn ConsumerClient>,
    queue: RecordQueue,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = queue.sender().reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                polled = client.poll() => match polled {
                    Ok(record) => permit.send(record),
                    Err(e) => {
                        error!(error = %e, "Kafka consumer error");
                        return Err(e);
                    }
                },
            }
        }

        debug!("Record poller stopped");
        Ok(())
    })
}
