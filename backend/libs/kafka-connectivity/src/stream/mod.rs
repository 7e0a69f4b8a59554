//! Consumer streams moving broker records through the transformer into the downstream sink.
//!
//! Both delivery modes share one pipeline task. It takes records from the bounded
//! [`RecordReceiver`], holds at most [`STAGING_SLOTS`] record while waiting for one of
//! `max_inflight` processing permits, and runs each record on its own task. The
//! at-least-once variant additionally tracks offsets and commits them as records settle.

mod at_least_once;
mod at_most_once;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::delivery::{
    CommitHandle, OffsetCompletion, TransformationError, TransformationErrorKind,
    TransformationResult,
};
use crate::error::{KafkaConnectivityError, Result};
use crate::message::{ExternalMessage, KafkaRecord};
use crate::metrics::InboundMonitor;
use crate::offsets::PartitionOffsetTracker;
use crate::sink::MessageSink;
use crate::source::{self, record_queue, ConsumerClient, ConsumerClientFactory, RecordReceiver};
use crate::transformer::KafkaMessageTransformer;

pub use at_least_once::AtLeastOnceConsumerStream;
pub use at_most_once::AtMostOnceConsumerStream;

/// Records a stream holds beyond `max_inflight` while waiting for a processing permit
pub const STAGING_SLOTS: usize = 1;

/// Delivery guarantee of a consumer stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Broker auto-commit, no waiting for the sink
    #[default]
    AtMostOnce,
    /// Offsets committed only once the sink settled the record
    AtLeastOnce,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub max_inflight: usize,
    /// Upper bound for finishing already fetched records on stop
    pub drain_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_inflight: 16,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// How a consumer stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Stopped on request or the source ran dry
    Completed,
    /// Ended by an error a fresh stream may not hit again
    Failed(String),
    /// Ended by an error no restart can fix, such as bad settings or a closed sink
    Aborted(String),
}

impl StreamOutcome {
    /// Outcome of a stream ended by `err`
    pub fn from_error(err: &KafkaConnectivityError) -> Self {
        if err.is_transient() {
            StreamOutcome::Failed(err.to_string())
        } else {
            StreamOutcome::Aborted(err.to_string())
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StreamOutcome::Failed(_) | StreamOutcome::Aborted(_))
    }

    /// Whether replacing the stream could help
    pub fn is_restartable(&self) -> bool {
        matches!(self, StreamOutcome::Failed(_))
    }
}

/// A running consumer stream
#[async_trait]
pub trait ConsumerStream: Send {
    /// Stop fetching and let already fetched records finish within the drain timeout
    async fn stop(&mut self);

    /// Resolves once the stream ended. Cancel safe, and repeatable after completion.
    async fn completion(&mut self) -> StreamOutcome;

    fn is_finished(&self) -> bool;
}

#[async_trait]
pub trait ConsumerStreamFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn ConsumerStream>>;
}

/// Everything a stream needs from the record source
pub struct StreamSource {
    receiver: RecordReceiver,
    client: Arc<dyn ConsumerClient>,
    poller: Option<JoinHandle<Result<()>>>,
    shutdown: watch::Sender<bool>,
}

impl StreamSource {
    /// Source fed by the caller through the queue paired with `receiver`
    pub fn new(receiver: RecordReceiver, client: Arc<dyn ConsumerClient>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            receiver,
            client,
            poller: None,
            shutdown,
        }
    }

    /// Source fed by a task polling `client`
    pub fn polling(client: Arc<dyn ConsumerClient>, queue_capacity: usize) -> Self {
        let (queue, receiver) = record_queue(queue_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let poller = source::spawn_poller(client.clone(), queue, shutdown_rx);
        Self {
            receiver,
            client,
            poller: Some(poller),
            shutdown,
        }
    }
}

/// Per-stream collaborators
#[derive(Clone)]
pub struct StreamContext {
    pub transformer: KafkaMessageTransformer,
    pub sink: Arc<dyn MessageSink>,
    pub settings: StreamSettings,
}

impl StreamContext {
    pub fn new(
        transformer: KafkaMessageTransformer,
        sink: Arc<dyn MessageSink>,
        settings: StreamSettings,
    ) -> Self {
        Self {
            transformer,
            sink,
            settings,
        }
    }

    fn monitor(&self) -> &dyn InboundMonitor {
        self.transformer.monitor()
    }

    /// Split a result into a deliverable message or a failure to report.
    ///
    /// Expired successes become failures of kind [`TransformationErrorKind::Expired`].
    fn route(
        &self,
        record: &KafkaRecord,
        result: TransformationResult,
    ) -> std::result::Result<ExternalMessage, TransformationError> {
        let expired = result.is_expired();
        match result {
            TransformationResult::Failure(error) => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %error,
                    "Record transformation failed"
                );
                Err(error)
            }
            TransformationResult::Success(message) if expired => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    "Dropping expired record"
                );
                self.monitor().expired(&record.topic);
                Err(TransformationError::new(
                    TransformationErrorKind::Expired,
                    format!(
                        "Message at {}/{} offset {} expired before delivery",
                        record.topic, record.partition, record.offset
                    ),
                    message.headers,
                ))
            }
            TransformationResult::Success(message) => Ok(message),
        }
    }
}

struct Committer {
    tracker: PartitionOffsetTracker,
    completions_tx: mpsc::UnboundedSender<OffsetCompletion>,
    completions: mpsc::UnboundedReceiver<OffsetCompletion>,
}

impl Committer {
    fn new() -> Self {
        let (completions_tx, completions) = mpsc::unbounded_channel();
        Self {
            tracker: PartitionOffsetTracker::new(),
            completions_tx,
            completions,
        }
    }
}

async fn next_completion(committer: &mut Option<Committer>) -> Option<OffsetCompletion> {
    match committer {
        Some(committer) => committer.completions.recv().await,
        None => std::future::pending().await,
    }
}

struct Pipeline {
    context: Arc<StreamContext>,
    receiver: RecordReceiver,
    client: Arc<dyn ConsumerClient>,
    shutdown: watch::Receiver<bool>,
    permits: Arc<Semaphore>,
    tasks: JoinSet<Result<()>>,
    committer: Option<Committer>,
}

impl Pipeline {
    async fn run(mut self, poller: Option<JoinHandle<Result<()>>>) -> StreamOutcome {
        let mut staged: Option<KafkaRecord> = None;
        let mut queue_done = false;
        let mut draining = false;
        let mut failure: Option<KafkaConnectivityError> = None;

        loop {
            if queue_done && staged.is_none() && self.tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = flatten(joined) {
                        failure = Some(e);
                        break;
                    }
                }
                Some(completion) = next_completion(&mut self.committer) => {
                    self.commit(completion);
                }
                _ = self.shutdown.changed(), if !draining => {
                    info!("Draining consumer stream");
                    draining = true;
                    self.receiver.close();
                }
                permit = self.permits.clone().acquire_owned(), if staged.is_some() => {
                    match (permit, staged.take()) {
                        (Ok(permit), Some(record)) => self.dispatch(record, permit),
                        _ => break,
                    }
                }
                record = self.receiver.recv(), if staged.is_none() && !queue_done => {
                    match record {
                        Some(record) => staged = Some(record),
                        None => queue_done = true,
                    }
                }
            }
        }

        if failure.is_some() {
            self.tasks.shutdown().await;
        }
        // settled records already reported their completions
        while let Some(completion) = self
            .committer
            .as_mut()
            .and_then(|committer| committer.completions.try_recv().ok())
        {
            self.commit(completion);
        }

        if let Some(poller) = poller {
            if queue_done && !draining && failure.is_none() {
                // the poller closed the queue by returning
                match poller.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => failure = Some(e),
                    Err(e) => failure = Some(join_failure(e)),
                }
            } else {
                poller.abort();
            }
        }

        self.client.close();

        match failure {
            Some(e) => {
                error!(error = %e, transient = e.is_transient(), "Consumer stream failed");
                StreamOutcome::from_error(&e)
            }
            None => {
                info!("Consumer stream completed");
                StreamOutcome::Completed
            }
        }
    }

    fn dispatch(&mut self, record: KafkaRecord, permit: OwnedSemaphorePermit) {
        let context = self.context.clone();
        match &mut self.committer {
            None => {
                self.tasks.spawn(async move {
                    let _permit = permit;
                    at_most_once::process(&context, record).await
                });
            }
            Some(committer) => {
                let topic_partition = record.topic_partition();
                committer.tracker.register(&topic_partition, record.offset);
                let handle = CommitHandle::new(
                    topic_partition,
                    record.offset,
                    committer.completions_tx.clone(),
                );
                self.tasks.spawn(async move {
                    let _permit = permit;
                    at_least_once::process(&context, record, handle).await
                });
            }
        }
    }

    fn commit(&mut self, completion: OffsetCompletion) {
        let Some(committer) = self.committer.as_mut() else {
            return;
        };
        let Some(offset) = committer
            .tracker
            .complete(&completion.topic_partition, completion.offset)
        else {
            return;
        };

        debug!(
            topic_partition = %completion.topic_partition,
            offset,
            "Committing offset"
        );
        if let Err(e) = self
            .client
            .commit(&[(completion.topic_partition.clone(), offset)])
        {
            warn!(
                topic_partition = %completion.topic_partition,
                offset,
                error = %e,
                "Failed to commit offset"
            );
        }
    }
}

fn flatten(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    joined.map_err(join_failure)?
}

fn join_failure(err: JoinError) -> KafkaConnectivityError {
    KafkaConnectivityError::StreamFailed(format!("record task aborted: {}", err))
}

/// Owner side of a spawned pipeline
struct PipelineHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<StreamOutcome>>,
    outcome: Option<StreamOutcome>,
    drain_timeout: Duration,
}

fn spawn_pipeline(
    source: StreamSource,
    context: StreamContext,
    mode: DeliveryMode,
) -> PipelineHandle {
    let StreamSource {
        receiver,
        client,
        poller,
        shutdown,
    } = source;
    let drain_timeout = context.settings.drain_timeout;

    let pipeline = Pipeline {
        permits: Arc::new(Semaphore::new(context.settings.max_inflight.max(1))),
        context: Arc::new(context),
        receiver,
        client,
        shutdown: shutdown.subscribe(),
        tasks: JoinSet::new(),
        committer: (mode == DeliveryMode::AtLeastOnce).then(Committer::new),
    };
    let task = tokio::spawn(pipeline.run(poller));

    PipelineHandle {
        shutdown,
        task: Some(task),
        outcome: None,
        drain_timeout,
    }
}

impl PipelineHandle {
    async fn stop(&mut self) {
        self.shutdown.send_replace(true);
        let Some(task) = self.task.as_mut() else {
            return;
        };

        let outcome = match tokio::time::timeout(self.drain_timeout, &mut *task).await {
            Ok(joined) => outcome_of(joined),
            Err(_) => {
                warn!(
                    timeout_ms = self.drain_timeout.as_millis() as u64,
                    "Consumer stream did not drain in time, aborting"
                );
                task.abort();
                StreamOutcome::Completed
            }
        };
        self.task = None;
        self.outcome = Some(outcome);
    }

    async fn completion(&mut self) -> StreamOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let outcome = match self.task.as_mut() {
            Some(task) => outcome_of(task.await),
            None => StreamOutcome::Completed,
        };
        self.task = None;
        self.outcome = Some(outcome.clone());
        outcome
    }

    fn is_finished(&self) -> bool {
        self.outcome.is_some() || self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

fn outcome_of(joined: std::result::Result<StreamOutcome, JoinError>) -> StreamOutcome {
    joined.unwrap_or_else(|e| StreamOutcome::Failed(format!("consumer stream task aborted: {}", e)))
}

/// Connects a broker client per stream and picks the variant from the delivery mode
pub struct KafkaConsumerStreamFactory {
    client_factory: Arc<dyn ConsumerClientFactory>,
    context: StreamContext,
    delivery_mode: DeliveryMode,
    queue_capacity: usize,
}

impl KafkaConsumerStreamFactory {
    pub fn new(
        client_factory: Arc<dyn ConsumerClientFactory>,
        context: StreamContext,
        delivery_mode: DeliveryMode,
        queue_capacity: usize,
    ) -> Self {
        Self {
            client_factory,
            context,
            delivery_mode,
            queue_capacity: queue_capacity.max(1),
        }
    }
}

#[async_trait]
impl ConsumerStreamFactory for KafkaConsumerStreamFactory {
    async fn create(&self) -> Result<Box<dyn ConsumerStream>> {
        let client = self.client_factory.connect().await?;
        let source = StreamSource::polling(client, self.queue_capacity);
        let context = self.context.clone();

        let stream: Box<dyn ConsumerStream> = match self.delivery_mode {
            DeliveryMode::AtMostOnce => Box::new(AtMostOnceConsumerStream::start(source, context)),
            DeliveryMode::AtLeastOnce => {
                Box::new(AtLeastOnceConsumerStream::start(source, context))
            }
        };
        debug!(mode = ?self.delivery_mode, "Consumer stream created");
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_mode_serde() {
        let mode: DeliveryMode = serde_json::from_str("\"at_least_once\"").unwrap();
        assert_eq!(mode, DeliveryMode::AtLeastOnce);
        assert_eq!(
            serde_json::to_string(&DeliveryMode::AtMostOnce).unwrap(),
            "\"at_most_once\""
        );
        assert_eq!(DeliveryMode::default(), DeliveryMode::AtMostOnce);
    }

    #[test]
    fn test_outcome_failure() {
        assert!(StreamOutcome::Failed("boom".to_string()).is_failure());
        assert!(!StreamOutcome::Completed.is_failure());
    }

    #[test]
    fn test_outcome_from_error_keeps_transience() {
        let outcome = StreamOutcome::from_error(&KafkaConnectivityError::OffsetCommit(
            "coordinator moved".to_string(),
        ));
        assert!(outcome.is_restartable());

        let outcome = StreamOutcome::from_error(&KafkaConnectivityError::SinkClosed);
        assert_eq!(
            outcome,
            StreamOutcome::Aborted("Downstream sink closed".to_string())
        );
        assert!(outcome.is_failure());
        assert!(!outcome.is_restartable());
    }
}
