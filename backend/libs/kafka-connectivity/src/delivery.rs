//! Delivery primitives passed between the transformer, the consumer streams and the sink.

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::headers::{self, MessageHeaders};
use crate::message::{ExternalMessage, TopicPartition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformationErrorKind {
    /// A placeholder in the enforcement configuration could not be resolved
    UnresolvedPlaceholder,
    /// The enforcement input did not match any of the expected values
    EnforcementMismatch,
    /// The message outlived its `ttl`
    Expired,
    /// The downstream sink rejected the message
    Rejected,
}

/// Failure produced while turning a broker record into an envelope.
///
/// Keeps the headers of the originating record so that expiry and correlation still work.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct TransformationError {
    pub kind: TransformationErrorKind,
    pub message: String,
    pub headers: MessageHeaders,
}

impl TransformationError {
    pub fn new(
        kind: TransformationErrorKind,
        message: impl Into<String>,
        headers: MessageHeaders,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            headers,
        }
    }
}

/// Outcome of transforming one consumed record
#[derive(Debug, Clone, PartialEq)]
pub enum TransformationResult {
    Success(ExternalMessage),
    Failure(TransformationError),
}

impl TransformationResult {
    pub fn successful(message: ExternalMessage) -> Self {
        TransformationResult::Success(message)
    }

    pub fn failed(error: TransformationError) -> Self {
        TransformationResult::Failure(error)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TransformationResult::Success(_))
    }

    pub fn headers(&self) -> &MessageHeaders {
        match self {
            TransformationResult::Success(message) => &message.headers,
            TransformationResult::Failure(error) => &error.headers,
        }
    }

    /// Whether `creation-time + ttl` already lies in the past
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp_millis())
    }

    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        let headers = self.headers();
        let creation_time = headers
            .get(headers::CREATION_TIME)
            .and_then(|value| value.trim().parse::<i64>().ok());
        let ttl = headers
            .get(headers::TTL)
            .and_then(|value| value.trim().parse::<i64>().ok());

        match (creation_time, ttl) {
            (Some(creation_time), Some(ttl)) => now_millis > creation_time.saturating_add(ttl),
            _ => false,
        }
    }
}

/// Completion reported by a [`CommitHandle`] to the stream owning the offsets
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OffsetCompletion {
    pub topic_partition: TopicPartition,
    pub offset: i64,
}

/// Token that marks one consumed offset as done when invoked.
///
/// Dropping the handle without calling [`CommitHandle::commit`] withholds the offset,
/// so the record is redelivered after the next restart.
#[derive(Debug)]
pub struct CommitHandle {
    topic_partition: TopicPartition,
    offset: i64,
    completions: mpsc::UnboundedSender<OffsetCompletion>,
}

impl CommitHandle {
    pub(crate) fn new(
        topic_partition: TopicPartition,
        offset: i64,
        completions: mpsc::UnboundedSender<OffsetCompletion>,
    ) -> Self {
        Self {
            topic_partition,
            offset,
            completions,
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn commit(self) {
        let completion = OffsetCompletion {
            topic_partition: self.topic_partition,
            offset: self.offset,
        };
        if self.completions.send(completion).is_err() {
            debug!("Offset completion arrived after the consumer stream ended");
        }
    }
}

/// A transformation result paired with the offset it came from
#[derive(Debug)]
pub struct CommittableTransformationResult {
    pub result: TransformationResult,
    pub commit_handle: CommitHandle,
}

impl CommittableTransformationResult {
    pub fn new(result: TransformationResult, commit_handle: CommitHandle) -> Self {
        Self {
            result,
            commit_handle,
        }
    }
}

/// Answer of the downstream sink for one delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkAck {
    Acknowledged,
    /// `redeliver` asks for the message to be consumed again
    Rejected { redeliver: bool },
}

/// Envelope plus the callback the sink uses to settle it
#[derive(Debug)]
pub struct AcknowledgeableMessage {
    message: ExternalMessage,
    responder: oneshot::Sender<SinkAck>,
}

impl AcknowledgeableMessage {
    pub fn new(message: ExternalMessage) -> (Self, oneshot::Receiver<SinkAck>) {
        let (responder, receiver) = oneshot::channel();
        (Self { message, responder }, receiver)
    }

    pub fn message(&self) -> &ExternalMessage {
        &self.message
    }

    pub fn acknowledge(self) {
        self.settle(SinkAck::Acknowledged);
    }

    pub fn reject(self, redeliver: bool) {
        self.settle(SinkAck::Rejected { redeliver });
    }

    /// Splits off the envelope; the returned responder settles the message later
    pub fn into_parts(self) -> (ExternalMessage, oneshot::Sender<SinkAck>) {
        (self.message, self.responder)
    }

    fn settle(self, ack: SinkAck) {
        // at-most-once streams do not listen for acknowledgements
        let _ = self.responder.send(ack);
    }
}
