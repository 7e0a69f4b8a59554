//! Publisher sending outbound messages to the broker and correlating the broker's answers
//! with the requesters of those messages.
//!
//! Messages wait in a bounded queue in front of `parallelism` concurrent sends. A message
//! that finds the queue full is answered right away with a `503` acknowledgement instead
//! of being queued. Acknowledgements always go to the `reply-to` address of the message,
//! and only when the message asked for the publisher's label in `requested-acks`.
//!
//! Every accepted message is answered exactly once when acknowledgements were requested:
//! a shutdown that runs out of time answers the unsent ones with `503`.

mod acks;
mod producer;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use http::StatusCode;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::headers;
use crate::message::ExternalMessage;
use crate::metrics::OutboundMonitor;
use crate::target::PublishTarget;

pub use acks::{Acknowledgement, AcknowledgementRouter, RecordMetadata};
pub use producer::{ProducerRecord, RdKafkaSendProducer, SendError, SendProducer};

/// One message and the address it goes to
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub address: String,
    pub message: ExternalMessage,
}

impl OutboundMessage {
    pub fn new(address: impl Into<String>, message: ExternalMessage) -> Self {
        Self {
            address: address.into(),
            message,
        }
    }
}

/// Messages produced from the same origin
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundSignal {
    pub messages: Vec<OutboundMessage>,
}

impl OutboundSignal {
    pub fn new(messages: Vec<OutboundMessage>) -> Self {
        Self { messages }
    }

    pub fn single(address: impl Into<String>, message: ExternalMessage) -> Self {
        Self::new(vec![OutboundMessage::new(address, message)])
    }
}

const ABANDONED: &str = "The publisher stopped before the message was sent";

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// Messages that may wait for a send
    pub queue_size: usize,
    /// Concurrent sends
    pub parallelism: usize,
    /// Label of the acknowledgements this publisher issues
    pub ack_label: String,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            queue_size: 1000,
            parallelism: 10,
            ack_label: "kafka:published".to_string(),
        }
    }
}

struct QueuedSend {
    target: PublishTarget,
    message: ExternalMessage,
}

/// Shared by the intake side and the send task
struct Correlator {
    label: String,
    router: Arc<dyn AcknowledgementRouter>,
}

impl Correlator {
    /// Route `build()` to the requester, if the message asked for our label
    fn acknowledge(
        &self,
        message: &ExternalMessage,
        build: impl FnOnce(Option<String>) -> Acknowledgement,
    ) {
        if !headers::requested_acks(&message.headers)
            .iter()
            .any(|label| label == &self.label)
        {
            return;
        }

        let Some(requester) = message.header(headers::REPLY_TO) else {
            debug!(
                correlation_id = ?message.correlation_id(),
                "Acknowledgement requested without reply-to header"
            );
            return;
        };

        let acknowledgement = build(message.correlation_id().map(str::to_string));
        self.router.route(requester, acknowledgement);
    }

    fn reject(&self, message: &ExternalMessage, status: StatusCode, reason: &str) {
        self.acknowledge(message, |correlation_id| {
            Acknowledgement::failed(self.label.clone(), status, correlation_id, reason)
        });
    }
}

pub struct KafkaPublisher {
    queue: mpsc::Sender<QueuedSend>,
    queue_size: usize,
    shutdown: watch::Sender<bool>,
    /// Set once a shutdown gave up waiting; unsent messages are rejected
    abandon: watch::Sender<bool>,
    correlator: Arc<Correlator>,
    monitor: Arc<dyn OutboundMonitor>,
    sender: Mutex<Option<JoinHandle<()>>>,
}

impl KafkaPublisher {
    pub fn start(
        producer: Arc<dyn SendProducer>,
        settings: PublisherSettings,
        router: Arc<dyn AcknowledgementRouter>,
        monitor: Arc<dyn OutboundMonitor>,
    ) -> Self {
        let queue_size = settings.queue_size.max(1);
        let parallelism = settings.parallelism.max(1);
        let (queue, queue_rx) = mpsc::channel(queue_size);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (abandon, abandon_rx) = watch::channel(false);
        let correlator = Arc::new(Correlator {
            label: settings.ack_label,
            router,
        });

        let sender = tokio::spawn(run_sends(
            queue_rx,
            shutdown_rx,
            abandon_rx,
            parallelism,
            producer,
            correlator.clone(),
            monitor.clone(),
        ));
        info!(queue_size, parallelism, "Kafka publisher started");

        Self {
            queue,
            queue_size,
            shutdown,
            abandon,
            correlator,
            monitor,
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Queue every message of `signal` for sending. Never blocks.
    ///
    /// Messages that cannot be queued are answered with a negative acknowledgement:
    /// `400` for an invalid address, `503` when the queue is full or the publisher stopped.
    pub fn publish(&self, signal: OutboundSignal) {
        for OutboundMessage { address, message } in signal.messages {
            let target = match PublishTarget::parse(&address) {
                Ok(target) => target,
                Err(e) => {
                    warn!(address = %address, error = %e, "Invalid publish target");
                    self.monitor.failed(&address);
                    self.correlator
                        .reject(&message, StatusCode::BAD_REQUEST, &e.to_string());
                    continue;
                }
            };

            if *self.shutdown.borrow() {
                self.correlator.reject(
                    &message,
                    StatusCode::SERVICE_UNAVAILABLE,
                    "The publisher is shutting down",
                );
                continue;
            }

            match self.queue.try_send(QueuedSend { target, message }) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(rejected)) => {
                    warn!(
                        topic = %rejected.target.topic,
                        queue_size = self.queue_size,
                        "Send queue full, rejecting message"
                    );
                    self.monitor.dropped();
                    self.correlator.reject(
                        &rejected.message,
                        StatusCode::SERVICE_UNAVAILABLE,
                        &format!(
                            "There are too many uncommitted messages: {} are already waiting to be published",
                            self.queue_size
                        ),
                    );
                }
                Err(mpsc::error::TrySendError::Closed(rejected)) => {
                    self.correlator.reject(
                        &rejected.message,
                        StatusCode::SERVICE_UNAVAILABLE,
                        "The publisher is stopped",
                    );
                }
            }
        }
    }

    /// Stop accepting messages and wait up to `timeout` for queued ones to be sent.
    ///
    /// Returns whether the queue drained in time. Otherwise pending sends are cancelled,
    /// and they and the still queued messages are answered with `503`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.send_replace(true);
        let Some(mut sender) = self.sender.lock().await.take() else {
            return true;
        };

        match tokio::time::timeout(timeout, &mut sender).await {
            Ok(_) => {
                info!("Kafka publisher stopped");
                true
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Kafka publisher did not drain in time, rejecting unsent messages"
                );
                self.abandon.send_replace(true);
                if let Err(e) = sender.await {
                    warn!(error = %e, "Kafka publisher send task failed");
                }
                false
            }
        }
    }
}

async fn run_sends(
    queue: mpsc::Receiver<QueuedSend>,
    shutdown: watch::Receiver<bool>,
    abandon: watch::Receiver<bool>,
    parallelism: usize,
    producer: Arc<dyn SendProducer>,
    correlator: Arc<Correlator>,
    monitor: Arc<dyn OutboundMonitor>,
) {
    let queued = futures::stream::unfold(
        (queue, shutdown),
        |(mut queue, mut shutdown)| async move {
            loop {
                let stopping = *shutdown.borrow_and_update();
                if stopping {
                    // drain what is queued, then end
                    queue.close();
                }

                tokio::select! {
                    biased;

                    next = queue.recv() => return next.map(|send| (send, (queue, shutdown))),
                    changed = shutdown.changed(), if !stopping => {
                        if changed.is_err() {
                            queue.close();
                        }
                    }
                }
            }
        },
    );

    queued
        .for_each_concurrent(parallelism, |QueuedSend { target, message }| {
            let producer = producer.clone();
            let correlator = correlator.clone();
            let monitor = monitor.clone();
            let mut abandon = abandon.clone();
            async move {
                if *abandon.borrow() {
                    monitor.failed(&target.topic);
                    correlator.reject(&message, StatusCode::SERVICE_UNAVAILABLE, ABANDONED);
                    return;
                }

                let record = ProducerRecord::new(&target, &message);
                let sent = tokio::select! {
                    biased;

                    sent = producer.send(record) => sent,
                    _ = abandoned(&mut abandon) => {
                        warn!(topic = %target.topic, "Send cancelled by shutdown");
                        monitor.failed(&target.topic);
                        correlator.reject(&message, StatusCode::SERVICE_UNAVAILABLE, ABANDONED);
                        return;
                    }
                };

                match sent {
                    Ok(metadata) => {
                        debug!(
                            topic = %metadata.topic,
                            partition = metadata.partition,
                            offset = metadata.offset,
                            "Message published"
                        );
                        monitor.published(&target.topic);
                        correlator.acknowledge(&message, |correlation_id| {
                            Acknowledgement::published(
                                correlator.label.clone(),
                                correlation_id,
                                &metadata,
                            )
                        });
                    }
                    Err(e) => {
                        warn!(topic = %target.topic, error = %e, "Failed to publish message");
                        monitor.failed(&target.topic);
                        correlator.reject(&message, e.status(), &e.to_string());
                    }
                }
            }
        })
        .await;

    debug!("Send queue drained");
}

/// Resolves once a shutdown gave up on pending sends
async fn abandoned(abandon: &mut watch::Receiver<bool>) {
    if abandon.wait_for(|abandoned| *abandoned).await.is_err() {
        // publisher dropped without a shutdown, let the send finish
        std::future::pending::<()>().await;
    }
}
