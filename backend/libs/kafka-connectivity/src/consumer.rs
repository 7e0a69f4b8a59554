//! Consumer actor owning one supervised consumer stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use resilience::RestartBackoff;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::error::{KafkaConnectivityError, Result};
use crate::stream::{ConsumerStreamFactory, StreamOutcome};
use crate::supervisor::{RestartableConsumerStream, SupervisorState};

const MAILBOX_CAPACITY: usize = 32;

/// Describes one logical source bound to one physical consumer instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerData {
    /// Source address, usually the topic
    pub address: String,
    pub consumer_index: usize,
    pub authorization_context: Vec<String>,
    /// Target header name to source header name
    pub header_mapping: HashMap<String, String>,
    pub reply_target: Option<String>,
}

impl ConsumerData {
    pub fn new(address: impl Into<String>, consumer_index: usize) -> Self {
        Self {
            address: address.into(),
            consumer_index,
            ..Default::default()
        }
    }

    pub fn with_authorization_context(mut self, context: Vec<String>) -> Self {
        self.authorization_context = context;
        self
    }

    pub fn with_header_mapping(
        mut self,
        target: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        self.header_mapping.insert(target.into(), source.into());
        self
    }

    pub fn with_reply_target(mut self, reply_target: impl Into<String>) -> Self {
        self.reply_target = Some(reply_target.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerActorState {
    Created,
    Started,
    Stopping,
    /// Terminal; the broker client has been released
    Stopped,
}

/// Reply to a graceful stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GracefulStopAck {
    /// Whether in-flight records finished before the timeout
    pub drained: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerStatus {
    pub address: String,
    pub consumer_index: usize,
    pub state: ConsumerActorState,
    pub stream: SupervisorState,
}

enum ConsumerMessage {
    GracefulStop {
        timeout: Duration,
        reply: oneshot::Sender<GracefulStopAck>,
    },
    Restart {
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<ConsumerStatus>,
    },
}

pub struct KafkaConsumerActor {
    consumer_data: Arc<ConsumerData>,
    factory: Arc<dyn ConsumerStreamFactory>,
    backoff: RestartBackoff,
    mailbox: mpsc::Receiver<ConsumerMessage>,
    state: watch::Sender<ConsumerActorState>,
}

impl KafkaConsumerActor {
    /// Spawn the actor; its stream starts right away
    pub fn spawn(
        consumer_data: Arc<ConsumerData>,
        factory: Arc<dyn ConsumerStreamFactory>,
        backoff: RestartBackoff,
    ) -> KafkaConsumerActorHandle {
        let (mailbox_tx, mailbox) = mpsc::channel(MAILBOX_CAPACITY);
        let (state_tx, state) = watch::channel(ConsumerActorState::Created);

        let actor = Self {
            consumer_data,
            factory,
            backoff,
            mailbox,
            state: state_tx,
        };
        tokio::spawn(actor.run());

        KafkaConsumerActorHandle {
            mailbox: mailbox_tx,
            state,
        }
    }

    async fn run(mut self) {
        let address = self.consumer_data.address.clone();
        let index = self.consumer_data.consumer_index;

        let supervisor = RestartableConsumerStream::start(self.factory.clone(), self.backoff);
        self.state.send_replace(ConsumerActorState::Started);
        info!(address = %address, index, "Kafka consumer started");

        loop {
            tokio::select! {
                message = self.mailbox.recv() => match message {
                    Some(ConsumerMessage::GracefulStop { timeout, reply }) => {
                        info!(address = %address, index, "Gracefully stopping Kafka consumer");
                        self.state.send_replace(ConsumerActorState::Stopping);
                        let drained = tokio::time::timeout(timeout, supervisor.stop())
                            .await
                            .is_ok();
                        if !drained {
                            warn!(
                                address = %address,
                                index,
                                timeout_ms = timeout.as_millis() as u64,
                                "Kafka consumer did not drain in time"
                            );
                        }
                        self.state.send_replace(ConsumerActorState::Stopped);
                        let _ = reply.send(GracefulStopAck { drained });
                        break;
                    }
                    Some(ConsumerMessage::Restart { reply }) => {
                        let _ = reply.send(supervisor.restart().await);
                    }
                    Some(ConsumerMessage::Status { reply }) => {
                        let _ = reply.send(ConsumerStatus {
                            address: address.clone(),
                            consumer_index: index,
                            state: *self.state.borrow(),
                            stream: supervisor.state(),
                        });
                    }
                    None => {
                        self.state.send_replace(ConsumerActorState::Stopping);
                        supervisor.stop().await;
                        self.state.send_replace(ConsumerActorState::Stopped);
                        break;
                    }
                },
                outcome = supervisor.when_complete() => {
                    match outcome {
                        StreamOutcome::Completed => {
                            info!(address = %address, index, "Kafka consumer stream ended")
                        }
                        StreamOutcome::Failed(reason) | StreamOutcome::Aborted(reason) => warn!(
                            address = %address,
                            index,
                            error = %reason,
                            "Kafka consumer stream gave up"
                        ),
                    }
                    self.state.send_replace(ConsumerActorState::Stopped);
                    break;
                }
            }
        }

        info!(address = %address, index, "Kafka consumer stopped");
    }
}

/// Mailbox of a running [`KafkaConsumerActor`]
#[derive(Clone)]
pub struct KafkaConsumerActorHandle {
    mailbox: mpsc::Sender<ConsumerMessage>,
    state: watch::Receiver<ConsumerActorState>,
}

impl KafkaConsumerActorHandle {
    pub fn state(&self) -> ConsumerActorState {
        *self.state.borrow()
    }

    /// Stop fetching, let fetched records finish within `timeout`, then release the client
    pub async fn graceful_stop(&self, timeout: Duration) -> Result<GracefulStopAck> {
        let (reply, ack) = oneshot::channel();
        self.mailbox
            .send(ConsumerMessage::GracefulStop { timeout, reply })
            .await
            .map_err(|_| KafkaConnectivityError::ActorStopped)?;
        ack.await.map_err(|_| KafkaConnectivityError::ActorStopped)
    }

    pub async fn restart(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.mailbox
            .send(ConsumerMessage::Restart { reply })
            .await
            .map_err(|_| KafkaConnectivityError::ActorStopped)?;
        done.await.map_err(|_| KafkaConnectivityError::ActorStopped)?
    }

    pub async fn status(&self) -> Result<ConsumerStatus> {
        let (reply, status) = oneshot::channel();
        self.mailbox
            .send(ConsumerMessage::Status { reply })
            .await
            .map_err(|_| KafkaConnectivityError::ActorStopped)?;
        status.await.map_err(|_| KafkaConnectivityError::ActorStopped)
    }

    /// Resolves once the actor reached [`ConsumerActorState::Stopped`]
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        let _ = state
            .wait_for(|state| *state == ConsumerActorState::Stopped)
            .await;
    }
}
