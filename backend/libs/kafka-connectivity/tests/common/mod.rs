//! Hand-written fakes shared by the integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kafka_connectivity::{
    ConfigurationError, ConsumerClient, ConsumerClientFactory, ConsumerData, ConsumerStream,
    ConsumerStreamFactory, EnforcementFilter, InboundMonitor, KafkaConnectivityError,
    KafkaMessageTransformer, KafkaRecord, MessageSink, MonitorError, NoopMonitor, Result,
    StreamContext, StreamOutcome, StreamSettings, TopicPartition, TransformationResult,
};
use tokio::sync::{mpsc, watch};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn record(offset: i64) -> KafkaRecord {
    KafkaRecord::new("events", 0, offset)
        .with_payload(offset.to_string())
        .with_timestamp(1_700_000_000_000 + offset)
}

pub fn context(sink: Arc<dyn MessageSink>, max_inflight: usize) -> StreamContext {
    context_with(sink, max_inflight, None, Arc::new(NoopMonitor))
}

pub fn context_with(
    sink: Arc<dyn MessageSink>,
    max_inflight: usize,
    enforcement: Option<Arc<dyn EnforcementFilter>>,
    monitor: Arc<dyn InboundMonitor>,
) -> StreamContext {
    let transformer = KafkaMessageTransformer::new(
        Arc::new(ConsumerData::new("events", 0)),
        enforcement,
        monitor,
    );
    StreamContext::new(
        transformer,
        sink,
        StreamSettings {
            max_inflight,
            drain_timeout: Duration::from_secs(1),
        },
    )
}

/// Monitor whose backend is down; counts the records dropped because of it
#[derive(Default)]
pub struct UnavailableMonitor {
    pub dropped: AtomicUsize,
}

impl UnavailableMonitor {
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}

impl InboundMonitor for UnavailableMonitor {
    fn transformed(
        &self,
        _: &KafkaRecord,
        _: &TransformationResult,
    ) -> std::result::Result<(), MonitorError> {
        Err(MonitorError::Unavailable("metrics backend down".to_string()))
    }

    fn expired(&self, _: &str) {}

    fn dropped(&self, _: &str) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Broker client fed from a channel. Polls pend once the script is exhausted.
pub struct FakeConsumerClient {
    records: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<KafkaRecord>>>,
    commits: Mutex<Vec<(TopicPartition, i64)>>,
    closed: AtomicBool,
}

impl FakeConsumerClient {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<Result<KafkaRecord>>) {
        let (script, records) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            records: tokio::sync::Mutex::new(records),
            commits: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        (client, script)
    }

    pub fn commits(&self) -> Vec<(TopicPartition, i64)> {
        self.commits.lock().unwrap().clone()
    }

    pub fn committed_offsets(&self) -> Vec<i64> {
        self.commits().into_iter().map(|(_, offset)| offset).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsumerClient for FakeConsumerClient {
    async fn poll(&self) -> Result<KafkaRecord> {
        let next = self.records.lock().await.recv().await;
        match next {
            Some(record) => record,
            None => std::future::pending().await,
        }
    }

    fn commit(&self, offsets: &[(TopicPartition, i64)]) -> Result<()> {
        self.commits.lock().unwrap().extend_from_slice(offsets);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out scripted clients, one per connect
pub struct FakeClientFactory {
    clients: Mutex<Vec<Arc<FakeConsumerClient>>>,
    pub connects: AtomicUsize,
}

impl FakeClientFactory {
    pub fn new(clients: Vec<Arc<FakeConsumerClient>>) -> Self {
        Self {
            clients: Mutex::new(clients),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsumerClientFactory for FakeClientFactory {
    async fn connect(&self) -> Result<Arc<dyn ConsumerClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let mut clients = self.clients.lock().unwrap();
        if clients.is_empty() {
            return Err(KafkaConnectivityError::StreamStart(
                "no broker available".to_string(),
            ));
        }
        let client: Arc<dyn ConsumerClient> = clients.remove(0);
        Ok(client)
    }
}

/// Stream whose end is decided by the test
pub struct FakeStream {
    outcome: watch::Receiver<Option<StreamOutcome>>,
    stops: Arc<AtomicUsize>,
    stopped: bool,
}

#[async_trait]
impl ConsumerStream for FakeStream {
    async fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn completion(&mut self) -> StreamOutcome {
        if self.stopped {
            return StreamOutcome::Completed;
        }
        let mut outcome = self.outcome.clone();
        let resolved = match outcome.wait_for(Option::is_some).await {
            Ok(outcome) => Some(outcome.clone().unwrap_or(StreamOutcome::Completed)),
            Err(_) => None,
        };
        match resolved {
            Some(outcome) => outcome,
            None => std::future::pending().await,
        }
    }

    fn is_finished(&self) -> bool {
        self.stopped || self.outcome.borrow().is_some()
    }
}

/// Counts created and stopped streams
#[derive(Default)]
pub struct FakeStreamFactory {
    pub created: AtomicUsize,
    pub stops: Arc<AtomicUsize>,
    /// Every `create` call, successful or not
    pub attempts: AtomicUsize,
    /// Upcoming `create` calls that fail
    pub failing_creates: AtomicUsize,
    /// Fail every `create` call with a configuration error
    pub misconfigured: AtomicBool,
    controls: Mutex<Vec<watch::Sender<Option<StreamOutcome>>>>,
}

impl FakeStreamFactory {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// End the most recently created stream with `outcome`
    pub fn finish_latest(&self, outcome: StreamOutcome) {
        if let Some(control) = self.controls.lock().unwrap().last() {
            control.send_replace(Some(outcome));
        }
    }
}

#[async_trait]
impl ConsumerStreamFactory for FakeStreamFactory {
    async fn create(&self) -> Result<Box<dyn ConsumerStream>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.misconfigured.load(Ordering::SeqCst) {
            return Err(ConfigurationError::InvalidSettings(
                "consumer.max_inflight must be positive".to_string(),
            )
            .into());
        }

        let failing = self
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(KafkaConnectivityError::StreamStart(
                "broker unreachable".to_string(),
            ));
        }

        self.created.fetch_add(1, Ordering::SeqCst);
        let (control, outcome) = watch::channel(None);
        self.controls.lock().unwrap().push(control);
        Ok(Box::new(FakeStream {
            outcome,
            stops: self.stops.clone(),
            stopped: false,
        }))
    }
}
