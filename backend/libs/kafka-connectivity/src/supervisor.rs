//! Restart supervisor for consumer streams.
//!
//! [`RestartableConsumerStream`] owns whichever stream the factory produced last. A stream
//! that fails with a transient error is replaced after an exponential backoff delay. A
//! stream that completes normally, or fails in a way no restart fixes (bad settings, a
//! closed sink), ends supervision. The same split applies to factory errors.

use std::sync::Arc;

use resilience::RestartBackoff;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

use crate::error::{KafkaConnectivityError, Result};
use crate::stream::{ConsumerStream, ConsumerStreamFactory, StreamOutcome};

/// Lifecycle of a supervised stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Running,
    /// Between streams, either waiting out a backoff delay or replacing the stream on request
    Restarting,
    Stopping,
    /// Terminal
    Stopped,
}

enum Command {
    Stop(oneshot::Sender<()>),
    Restart(oneshot::Sender<Result<()>>),
}

/// Handle to a supervised consumer stream
#[derive(Clone)]
pub struct RestartableConsumerStream {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SupervisorState>,
    outcome: watch::Receiver<Option<StreamOutcome>>,
}

impl RestartableConsumerStream {
    /// Create the first stream and supervise it from a background task
    pub fn start(factory: Arc<dyn ConsumerStreamFactory>, backoff: RestartBackoff) -> Self {
        Self::spawn(factory, backoff).0
    }

    /// Like [`RestartableConsumerStream::start`], also returning the supervising task
    pub fn spawn(
        factory: Arc<dyn ConsumerStreamFactory>,
        backoff: RestartBackoff,
    ) -> (Self, JoinHandle<()>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SupervisorState::Restarting);
        let (outcome_tx, outcome) = watch::channel(None);

        let supervisor = Supervisor {
            factory,
            backoff,
            commands: command_rx,
            state: state_tx,
            outcome: outcome_tx,
        };
        let task = tokio::spawn(supervisor.run());

        (
            Self {
                commands,
                state,
                outcome,
            },
            task,
        )
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    /// Stop the current stream and end supervision.
    ///
    /// Idempotent; cancels a pending restart.
    pub async fn stop(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Stop(reply)).is_ok() {
            // the supervisor may already be gone
            let _ = done.await;
        }
        self.when_complete().await;
    }

    /// Stop the current stream, then create exactly one replacement
    pub async fn restart(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Restart(reply))
            .map_err(|_| KafkaConnectivityError::SupervisorStopped)?;
        done.await
            .map_err(|_| KafkaConnectivityError::SupervisorStopped)?
    }

    /// Resolves with the final outcome once supervision ended
    pub async fn when_complete(&self) -> StreamOutcome {
        let mut receiver = self.outcome.clone();
        let outcome = match receiver.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(StreamOutcome::Completed),
            Err(_) => StreamOutcome::Failed("supervisor task ended unexpectedly".to_string()),
        };
        outcome
    }
}

struct Supervisor {
    factory: Arc<dyn ConsumerStreamFactory>,
    backoff: RestartBackoff,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<SupervisorState>,
    outcome: watch::Sender<Option<StreamOutcome>>,
}

enum Slot {
    Running(Box<dyn ConsumerStream>),
    /// Next factory attempt is due at the deadline
    Pending(Instant),
    /// Supervision ends with this outcome
    Done(StreamOutcome),
}

impl Supervisor {
    async fn run(mut self) {
        let mut slot = self.create_or_schedule().await;

        let final_outcome = loop {
            match slot {
                Slot::Done(outcome) => break outcome,
                Slot::Running(ref mut stream) => {
                    tokio::select! {
                        outcome = stream.completion() => match outcome {
                            StreamOutcome::Completed => {
                                info!("Consumer stream completed, ending supervision");
                                break StreamOutcome::Completed;
                            }
                            StreamOutcome::Aborted(reason) => {
                                error!(
                                    error = %reason,
                                    "Consumer stream cannot recover, ending supervision"
                                );
                                break StreamOutcome::Aborted(reason);
                            }
                            StreamOutcome::Failed(reason) => {
                                let delay = self.backoff.next_delay();
                                warn!(
                                    error = %reason,
                                    attempt = self.backoff.attempt(),
                                    delay_ms = delay.as_millis() as u64,
                                    "Consumer stream failed, scheduling restart"
                                );
                                self.set_state(SupervisorState::Restarting);
                                slot = Slot::Pending(Instant::now() + delay);
                            }
                        },
                        command = self.commands.recv() => match command {
                            Some(Command::Restart(reply)) => {
                                self.set_state(SupervisorState::Restarting);
                                stream.stop().await;
                                slot = self.replace(reply).await;
                            }
                            Some(Command::Stop(reply)) => {
                                self.set_state(SupervisorState::Stopping);
                                stream.stop().await;
                                let _ = reply.send(());
                                break StreamOutcome::Completed;
                            }
                            None => {
                                self.set_state(SupervisorState::Stopping);
                                stream.stop().await;
                                break StreamOutcome::Completed;
                            }
                        },
                    }
                }
                Slot::Pending(deadline) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => {
                            slot = self.create_or_schedule().await;
                        }
                        command = self.commands.recv() => match command {
                            Some(Command::Restart(reply)) => {
                                slot = self.replace(reply).await;
                            }
                            Some(Command::Stop(reply)) => {
                                info!("Cancelling pending consumer stream restart");
                                let _ = reply.send(());
                                break StreamOutcome::Completed;
                            }
                            None => break StreamOutcome::Completed,
                        },
                    }
                }
            }
        };

        self.set_state(SupervisorState::Stopped);
        self.outcome.send_replace(Some(final_outcome));

        // answer commands that raced with the end of supervision
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Stop(reply) => {
                    let _ = reply.send(());
                }
                Command::Restart(reply) => {
                    let _ = reply.send(Err(KafkaConnectivityError::SupervisorStopped));
                }
            }
        }
    }

    async fn create_or_schedule(&mut self) -> Slot {
        match self.create().await {
            Ok(stream) => Slot::Running(stream),
            Err(e) => self.after_failed_create(&e),
        }
    }

    /// Create a stream on request, reporting the factory result to the requester
    async fn replace(&mut self, reply: oneshot::Sender<Result<()>>) -> Slot {
        match self.create().await {
            Ok(stream) => {
                let _ = reply.send(Ok(()));
                Slot::Running(stream)
            }
            Err(e) => {
                let slot = self.after_failed_create(&e);
                let _ = reply.send(Err(e));
                slot
            }
        }
    }

    async fn create(&mut self) -> Result<Box<dyn ConsumerStream>> {
        let stream = self.factory.create().await?;
        self.backoff.record_start();
        self.set_state(SupervisorState::Running);
        info!("Consumer stream started");
        Ok(stream)
    }

    /// Schedule another attempt, unless retrying cannot help
    fn after_failed_create(&mut self, err: &KafkaConnectivityError) -> Slot {
        if !err.is_transient() {
            error!(error = %err, "Failed to create consumer stream, ending supervision");
            return Slot::Done(StreamOutcome::from_error(err));
        }

        let delay = self.backoff.next_delay();
        error!(
            error = %err,
            attempt = self.backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "Failed to create consumer stream, retrying"
        );
        self.set_state(SupervisorState::Restarting);
        Slot::Pending(Instant::now() + delay)
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.send_replace(state);
    }
}
