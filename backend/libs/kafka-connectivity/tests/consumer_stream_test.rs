/// Integration tests for the at-most-once and at-least-once consumer streams
mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{
    context, context_with, init_tracing, record, FakeClientFactory, FakeConsumerClient,
    UnavailableMonitor, WAIT,
};
use kafka_connectivity::headers::{self, MessageHeaders};
use kafka_connectivity::{
    record_queue, AtLeastOnceConsumerStream, AtMostOnceConsumerStream, ChannelSink,
    ConsumerStream, ConsumerStreamFactory, DeliveryMode, EnforcementError, EnforcementFilter,
    KafkaConnectivityError, KafkaConsumerStreamFactory, NoopMonitor, OfferResult, RecordQueue,
    StreamOutcome, StreamSource, TransformationErrorKind, STAGING_SLOTS,
};
use tokio::time::{sleep, timeout};

async fn wait_for_commits(client: &FakeConsumerClient, count: usize) {
    timeout(WAIT, async {
        while client.commits().len() < count {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("offsets were not committed in time");
}

async fn wait_for_offset(client: &FakeConsumerClient, offset: i64) {
    timeout(WAIT, async {
        while client.committed_offsets().last() != Some(&offset) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("offset was not committed in time");
}

// ==================== Bounded Queue ====================

async fn wait_until_pulled(queue: &RecordQueue) {
    timeout(WAIT, async {
        while queue.available() < queue.capacity() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stream did not take the record off the queue");
}

#[tokio::test]
async fn test_queue_fills_then_drops_with_stalled_sink() {
    init_tracing();
    let (client, _script) = FakeConsumerClient::new();
    // nobody reads from the sink, so its single buffer slot stalls the stream
    let (sink, _messages, _failures) = ChannelSink::new(1);
    let (queue, receiver) = record_queue(2);
    let max_inflight = 1;
    let mut stream = AtMostOnceConsumerStream::start(
        StreamSource::new(receiver, client.clone()),
        context(Arc::new(sink), max_inflight),
    );

    // one record sits in the sink buffer, then the in-flight window and staged slot fill up
    let absorbed = 1 + max_inflight + STAGING_SLOTS;
    let mut offset = 0;
    for _ in 0..absorbed {
        assert_eq!(queue.offer(record(offset)), OfferResult::Enqueued);
        wait_until_pulled(&queue).await;
        offset += 1;
    }

    for _ in 0..queue.capacity() {
        assert_eq!(queue.offer(record(offset)), OfferResult::Enqueued);
        offset += 1;
    }
    sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.available(), 0);

    assert_eq!(queue.offer(record(offset)), OfferResult::Dropped);
    assert_eq!(queue.offer(record(offset + 1)), OfferResult::Dropped);
    assert!(!stream.is_finished());

    stream.stop().await;
    assert!(stream.is_finished());
}

// ==================== At Most Once ====================

#[tokio::test]
async fn test_at_most_once_does_not_wait_for_sink() {
    let (client, _script) = FakeConsumerClient::new();
    let (sink, mut messages, _failures) = ChannelSink::new(8);
    let (queue, receiver) = record_queue(8);
    let mut stream = AtMostOnceConsumerStream::start(
        StreamSource::new(receiver, client.clone()),
        context(Arc::new(sink), 4),
    );

    for offset in 0..3 {
        assert_eq!(queue.offer(record(offset)), OfferResult::Enqueued);
    }
    drop(queue);

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(timeout(WAIT, messages.recv()).await.unwrap().unwrap());
    }

    // completes while every message is still unsettled
    let outcome = timeout(WAIT, stream.completion()).await.unwrap();
    assert_eq!(outcome, StreamOutcome::Completed);
    assert!(client.commits().is_empty());
    assert!(client.is_closed());

    let topic = held[0].message().header(headers::KAFKA_TOPIC).map(str::to_string);
    assert_eq!(topic.as_deref(), Some("events"));
    assert_eq!(held[0].message().source_address.as_deref(), Some("events"));
}

#[tokio::test]
async fn test_at_most_once_drops_expired_record() {
    let (client, _script) = FakeConsumerClient::new();
    let (sink, mut messages, mut failures) = ChannelSink::new(8);
    let (queue, receiver) = record_queue(8);
    let mut stream = AtMostOnceConsumerStream::start(
        StreamSource::new(receiver, client.clone()),
        context(Arc::new(sink), 4),
    );

    let expired = record(0)
        .with_header(headers::CREATION_TIME, "0")
        .with_header(headers::TTL, "1000");
    queue.offer(expired);
    queue.offer(record(1));

    let failure = timeout(WAIT, failures.recv()).await.unwrap().unwrap();
    assert_eq!(failure.kind, TransformationErrorKind::Expired);
    let message = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
    assert_eq!(message.message().text_payload.as_deref(), Some("1"));

    drop(queue);
    let outcome = timeout(WAIT, stream.completion()).await.unwrap();
    assert_eq!(outcome, StreamOutcome::Completed);
    assert!(messages.try_recv().is_err());
    assert!(client.commits().is_empty());
}

#[tokio::test]
async fn test_closed_sink_aborts_stream() {
    let (client, _script) = FakeConsumerClient::new();
    let (sink, messages, _failures) = ChannelSink::new(8);
    drop(messages);
    let (queue, receiver) = record_queue(8);
    let mut stream = AtMostOnceConsumerStream::start(
        StreamSource::new(receiver, client.clone()),
        context(Arc::new(sink), 4),
    );

    queue.offer(record(0));
    let outcome = timeout(WAIT, stream.completion()).await.unwrap();
    assert_eq!(
        outcome,
        StreamOutcome::Aborted("Downstream sink closed".to_string())
    );
    assert!(!outcome.is_restartable());
    assert!(client.is_closed());
}

// ==================== At Least Once ====================

#[tokio::test]
async fn test_commits_follow_acknowledgements_in_offset_order() {
    let (client, _script) = FakeConsumerClient::new();
    let (sink, mut messages, _failures) = ChannelSink::new(8);
    let (queue, receiver) = record_queue(8);
    let mut stream = AtLeastOnceConsumerStream::start(
        StreamSource::new(receiver, client.clone()),
        context(Arc::new(sink), 4),
    );

    for offset in 0..3 {
        assert_eq!(queue.offer(record(offset)), OfferResult::Enqueued);
    }

    let mut pending = HashMap::new();
    for _ in 0..3 {
        let message = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
        let offset: i64 = message
            .message()
            .text_payload
            .as_deref()
            .unwrap()
            .parse()
            .unwrap();
        pending.insert(offset, message);
    }
    assert!(client.commits().is_empty());

    // a later offset alone must not move the commit position
    pending.remove(&2).unwrap().acknowledge();
    sleep(Duration::from_millis(50)).await;
    assert!(client.commits().is_empty());

    pending.remove(&0).unwrap().acknowledge();
    wait_for_commits(&client, 1).await;
    assert_eq!(client.committed_offsets(), vec![1]);

    pending.remove(&1).unwrap().acknowledge();
    wait_for_commits(&client, 2).await;
    assert_eq!(client.committed_offsets(), vec![1, 3]);

    drop(queue);
    let outcome = timeout(WAIT, stream.completion()).await.unwrap();
    assert_eq!(outcome, StreamOutcome::Completed);
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_redelivery_request_fails_stream() {
    let (client, _script) = FakeConsumerClient::new();
    let (sink, mut messages, mut failures) = ChannelSink::new(8);
    let (queue, receiver) = record_queue(8);
    let mut stream = AtLeastOnceConsumerStream::start(
        StreamSource::new(receiver, client.clone()),
        context(Arc::new(sink), 4),
    );

    queue.offer(record(0));
    let message = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
    message.reject(true);

    let failure = timeout(WAIT, failures.recv()).await.unwrap().unwrap();
    assert_eq!(failure.kind, TransformationErrorKind::Rejected);

    match timeout(WAIT, stream.completion()).await.unwrap() {
        StreamOutcome::Failed(reason) => assert!(reason.contains("Redelivery requested")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(client.commits().is_empty());
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_rejection_without_redelivery_is_committed() {
    let (client, _script) = FakeConsumerClient::new();
    let (sink, mut messages, mut failures) = ChannelSink::new(8);
    let (queue, receiver) = record_queue(8);
    let _stream = AtLeastOnceConsumerStream::start(
        StreamSource::new(receiver, client.clone()),
        context(Arc::new(sink), 4),
    );

    queue.offer(record(0));
    let message = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
    message.reject(false);

    let failure = timeout(WAIT, failures.recv()).await.unwrap().unwrap();
    assert_eq!(failure.kind, TransformationErrorKind::Rejected);
    wait_for_commits(&client, 1).await;
    assert_eq!(client.committed_offsets(), vec![1]);
}

#[tokio::test]
async fn test_expired_record_reported_and_committed() {
    let (client, _script) = FakeConsumerClient::new();
    let (sink, mut messages, mut failures) = ChannelSink::new(8);
    let (queue, receiver) = record_queue(8);
    let _stream = AtLeastOnceConsumerStream::start(
        StreamSource::new(receiver, client.clone()),
        context(Arc::new(sink), 4),
    );

    let expired = record(0)
        .with_header(headers::CREATION_TIME, "0")
        .with_header(headers::TTL, "1000");
    queue.offer(expired);

    let failure = timeout(WAIT, failures.recv()).await.unwrap().unwrap();
    assert_eq!(failure.kind, TransformationErrorKind::Expired);
    wait_for_commits(&client, 1).await;
    assert_eq!(client.committed_offsets(), vec![1]);
    assert!(messages.try_recv().is_err());
}

// ==================== Polling Factory ====================

#[tokio::test]
async fn test_factory_stream_polls_until_client_error() {
    let (client, script) = FakeConsumerClient::new();
    let client_factory = Arc::new(FakeClientFactory::new(vec![client.clone()]));
    let (sink, mut messages, _failures) = ChannelSink::new(8);
    let factory = KafkaConsumerStreamFactory::new(
        client_factory.clone(),
        context(Arc::new(sink), 4),
        DeliveryMode::AtLeastOnce,
        4,
    );

    let mut stream = factory.create().await.unwrap();
    assert_eq!(client_factory.connects(), 1);

    script.send(Ok(record(0))).unwrap();
    script.send(Ok(record(1))).unwrap();
    for _ in 0..2 {
        let message = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
        message.acknowledge();
    }
    wait_for_offset(&client, 2).await;
    let committed = client.committed_offsets();
    assert!(committed.windows(2).all(|pair| pair[0] < pair[1]));

    script
        .send(Err(KafkaConnectivityError::StreamFailed(
            "broker went away".to_string(),
        )))
        .unwrap();
    let outcome = timeout(WAIT, stream.completion()).await.unwrap();
    assert!(outcome.is_failure());
    assert!(client.is_closed());

    // the only client is used up
    assert!(factory.create().await.is_err());
}

#[tokio::test]
async fn test_unreported_record_is_neither_delivered_nor_committed() {
    let (client, _script) = FakeConsumerClient::new();
    let (sink, mut messages, mut failures) = ChannelSink::new(8);
    let monitor = Arc::new(UnavailableMonitor::default());
    let (queue, receiver) = record_queue(8);
    let mut stream = AtLeastOnceConsumerStream::start(
        StreamSource::new(receiver, client.clone()),
        context_with(Arc::new(sink), 4, None, monitor.clone()),
    );

    queue.offer(record(0));
    queue.offer(record(1));
    timeout(WAIT, async {
        while monitor.dropped() < 2 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("records were not dropped");

    drop(queue);
    let outcome = timeout(WAIT, stream.completion()).await.unwrap();
    assert_eq!(outcome, StreamOutcome::Completed);
    assert!(messages.try_recv().is_err());
    assert!(failures.try_recv().is_err());
    assert!(client.commits().is_empty());
}

#[tokio::test]
async fn test_enforcement_failure_reported_and_committed() {
    let (client, _script) = FakeConsumerClient::new();
    let (sink, mut messages, mut failures) = ChannelSink::new(8);
    let enforcement: Arc<dyn EnforcementFilter> =
        Arc::new(|_: &str, _: &MessageHeaders| -> Result<(), EnforcementError> {
            Err(EnforcementError::UnresolvedPlaceholder(
                "{{ thing:id }}".to_string(),
            ))
        });
    let (queue, receiver) = record_queue(8);
    let _stream = AtLeastOnceConsumerStream::start(
        StreamSource::new(receiver, client.clone()),
        context_with(Arc::new(sink), 4, Some(enforcement), Arc::new(NoopMonitor)),
    );

    queue.offer(record(0).with_header(headers::CORRELATION_ID, "corr-7"));

    let failure = timeout(WAIT, failures.recv()).await.unwrap().unwrap();
    assert_eq!(failure.kind, TransformationErrorKind::UnresolvedPlaceholder);
    assert!(failure.to_string().contains("{{ thing:id }}"));
    assert_eq!(
        failure.headers.get(headers::CORRELATION_ID).map(String::as_str),
        Some("corr-7")
    );
    wait_for_commits(&client, 1).await;
    assert_eq!(client.committed_offsets(), vec![1]);
    assert!(messages.try_recv().is_err());
}

#[tokio::test]
async fn test_factory_with_zero_queue_capacity_still_consumes() {
    let (client, script) = FakeConsumerClient::new();
    let client_factory = Arc::new(FakeClientFactory::new(vec![client.clone()]));
    let (sink, mut messages, _failures) = ChannelSink::new(8);
    let factory = KafkaConsumerStreamFactory::new(
        client_factory,
        context(Arc::new(sink), 4),
        DeliveryMode::AtMostOnce,
        0,
    );

    let mut stream = factory.create().await.unwrap();
    for offset in 0..3 {
        script.send(Ok(record(offset))).unwrap();
    }
    for offset in 0..3 {
        let message = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
        let expected = offset.to_string();
        assert_eq!(message.message().text_payload.as_deref(), Some(expected.as_str()));
    }

    stream.stop().await;
    assert!(client.is_closed());
}
