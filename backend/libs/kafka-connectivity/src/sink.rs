//! Downstream seam of the consumer streams.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::delivery::{AcknowledgeableMessage, TransformationError};
use crate::error::{KafkaConnectivityError, Result};

/// Receives transformed messages and reports back through their responder.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Hand over one message. Errors mean the sink is gone and end the stream.
    async fn deliver(&self, message: AcknowledgeableMessage) -> Result<()>;

    /// Failure and monitoring channel for records that never reach [`MessageSink::deliver`]
    async fn deliver_failure(&self, error: TransformationError);
}

/// Sink backed by channels, for hosts that pull messages from a task of their own
#[derive(Debug, Clone)]
pub struct ChannelSink {
    messages: mpsc::Sender<AcknowledgeableMessage>,
    failures: mpsc::UnboundedSender<TransformationError>,
}

impl ChannelSink {
    pub fn new(
        buffer: usize,
    ) -> (
        Self,
        mpsc::Receiver<AcknowledgeableMessage>,
        mpsc::UnboundedReceiver<TransformationError>,
    ) {
        let (messages, message_rx) = mpsc::channel(buffer);
        let (failures, failure_rx) = mpsc::unbounded_channel();
        (Self { messages, failures }, message_rx, failure_rx)
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn deliver(&self, message: AcknowledgeableMessage) -> Result<()> {
        self.messages
            .send(message)
            .await
            .map_err(|_| KafkaConnectivityError::SinkClosed)
    }

    async fn deliver_failure(&self, error: TransformationError) {
        if self.failures.send(error).is_err() {
            warn!("Failure channel closed, dropping transformation failure");
        }
    }
}
