//! Fire-and-forget delivery; the broker commits offsets on its own schedule.

use async_trait::async_trait;
use tracing::debug;

use super::{
    spawn_pipeline, ConsumerStream, DeliveryMode, PipelineHandle, StreamContext, StreamOutcome,
    StreamSource,
};
use crate::delivery::AcknowledgeableMessage;
use crate::error::Result;
use crate::message::KafkaRecord;

/// Consumer stream that may lose records on a crash but never delivers one twice
pub struct AtMostOnceConsumerStream {
    handle: PipelineHandle,
}

impl AtMostOnceConsumerStream {
    pub fn start(source: StreamSource, context: StreamContext) -> Self {
        Self {
            handle: spawn_pipeline(source, context, DeliveryMode::AtMostOnce),
        }
    }
}

#[async_trait]
impl ConsumerStream for AtMostOnceConsumerStream {
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

pub(super) async fn process(context: &StreamContext, record: KafkaRecord) -> Result<()> {
    let Some(result) = context.transformer.transform(&record) else {
        context.monitor().dropped(&record.topic);
        return Ok(());
    };

    match context.route(&record, result) {
        Ok(message) => {
            // nobody waits for the acknowledgement in this mode
            let (message, _ack) = AcknowledgeableMessage::new(message);
            context.sink.deliver(message).await?;
            debug!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "Record delivered"
            );
        }
        Err(error) => context.sink.deliver_failure(error).await,
    }
    Ok(())
}
