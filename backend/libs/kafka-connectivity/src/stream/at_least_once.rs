//! Delivery with offsets committed only after the sink settled the record.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{
    spawn_pipeline, ConsumerStream, DeliveryMode, PipelineHandle, StreamContext, StreamOutcome,
    StreamSource,
};
use crate::delivery::{
    AcknowledgeableMessage, CommitHandle, CommittableTransformationResult, SinkAck,
    TransformationError, TransformationErrorKind,
};
use crate::error::{KafkaConnectivityError, Result};
use crate::message::KafkaRecord;

/// Consumer stream that never loses a record but may deliver one again after a restart.
///
/// A rejection asking for redelivery, or a message the sink dropped without answering,
/// fails the stream so that consumption resumes from the last committed offset.
pub struct AtLeastOnceConsumerStream {
    handle: PipelineHandle,
}

impl AtLeastOnceConsumerStream {
    pub fn start(source: StreamSource, context: StreamContext) -> Self {
        Self {
            handle: spawn_pipeline(source, context, DeliveryMode::AtLeastOnce),
        }
    }
}

#[async_trait]
impl ConsumerStream for AtLeastOnceConsumerStream {
    async fn stop(&mut self) {
        self.handle.stop().await;
    }

    async fn completion(&mut self) -> StreamOutcome {
        self.handle.completion().await
    }

    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

pub(super) async fn process(
    context: &StreamContext,
    record: KafkaRecord,
    commit_handle: CommitHandle,
) -> Result<()> {
    let Some(result) = context.transformer.transform(&record) else {
        debug!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            "Record dropped, withholding its offset"
        );
        context.monitor().dropped(&record.topic);
        return Ok(());
    };

    settle(
        context,
        record,
        CommittableTransformationResult::new(result, commit_handle),
    )
    .await
}

/// Deliver a transformed record and commit its offset once the sink settled it
async fn settle(
    context: &StreamContext,
    record: KafkaRecord,
    committable: CommittableTransformationResult,
) -> Result<()> {
    let CommittableTransformationResult {
        result,
        commit_handle,
    } = committable;

    let message = match context.route(&record, result) {
        Ok(message) => message,
        Err(error) => {
            context.sink.deliver_failure(error).await;
            commit_handle.commit();
            return Ok(());
        }
    };

    let headers = message.headers.clone();
    let (message, ack) = AcknowledgeableMessage::new(message);
    context.sink.deliver(message).await?;

    let redeliver = match ack.await {
        Ok(SinkAck::Acknowledged) => {
            debug!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "Record acknowledged"
            );
            commit_handle.commit();
            return Ok(());
        }
        Ok(SinkAck::Rejected { redeliver }) => redeliver,
        // responder dropped without an answer
        Err(_) => true,
    };

    warn!(
        topic = %record.topic,
        partition = record.partition,
        offset = record.offset,
        redeliver,
        "Record rejected by sink"
    );
    context.monitor().dropped(&record.topic);
    context
        .sink
        .deliver_failure(TransformationError::new(
            TransformationErrorKind::Rejected,
            format!(
                "Message at {}/{} offset {} was rejected downstream",
                record.topic, record.partition, record.offset
            ),
            headers,
        ))
        .await;

    if !redeliver {
        commit_handle.commit();
        return Ok(());
    }

    Err(KafkaConnectivityError::RedeliveryRequested {
        topic: record.topic,
        partition: record.partition,
        offset: record.offset,
    })
}
