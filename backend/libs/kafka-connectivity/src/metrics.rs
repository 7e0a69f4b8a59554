//! Prometheus metrics for inbound and outbound traffic.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use thiserror::Error;
use tracing::warn;

use crate::delivery::TransformationResult;
use crate::message::KafkaRecord;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Metrics error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Monitor unavailable: {0}")]
    Unavailable(String),
}

/// Side channel notified about every consumed record.
///
/// Failures of [`InboundMonitor::transformed`] make the transformer drop the record.
pub trait InboundMonitor: Send + Sync {
    fn transformed(
        &self,
        record: &KafkaRecord,
        result: &TransformationResult,
    ) -> Result<(), MonitorError>;

    fn expired(&self, topic: &str);

    /// Record left the pipeline without reaching the sink
    fn dropped(&self, topic: &str);
}

pub trait OutboundMonitor: Send + Sync {
    fn published(&self, topic: &str);

    fn failed(&self, topic: &str);

    /// Rejected because the send queue was full
    fn dropped(&self);
}

/// Monitor that records nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMonitor;

impl InboundMonitor for NoopMonitor {
    fn transformed(&self, _: &KafkaRecord, _: &TransformationResult) -> Result<(), MonitorError> {
        Ok(())
    }

    fn expired(&self, _: &str) {}

    fn dropped(&self, _: &str) {}
}

impl OutboundMonitor for NoopMonitor {
    fn published(&self, _: &str) {}

    fn failed(&self, _: &str) {}

    fn dropped(&self) {}
}

#[derive(Clone)]
pub struct ConnectivityMetrics {
    pub inbound_consumed: IntCounterVec,
    pub inbound_failed: IntCounterVec,
    pub inbound_expired: IntCounterVec,
    pub inbound_dropped: IntCounterVec,
    pub outbound_published: IntCounterVec,
    pub outbound_failed: IntCounterVec,
    pub outbound_dropped: IntCounter,
}

impl ConnectivityMetrics {
    pub fn new(connection_id: &str, registry: &Registry) -> Result<Self, MonitorError> {
        let topic_counter = |name: &str, help: &str| {
            IntCounterVec::new(
                Opts::new(name, help).const_label("connection", connection_id.to_string()),
                &["topic"],
            )
        };

        let inbound_consumed = topic_counter(
            "kafka_inbound_consumed_total",
            "Records consumed and transformed successfully",
        )?;
        let inbound_failed = topic_counter(
            "kafka_inbound_failed_total",
            "Records whose transformation failed",
        )?;
        let inbound_expired = topic_counter(
            "kafka_inbound_expired_total",
            "Records dropped because their ttl elapsed",
        )?;
        let inbound_dropped = topic_counter(
            "kafka_inbound_dropped_total",
            "Records that left the pipeline without reaching the sink",
        )?;
        let outbound_published = topic_counter(
            "kafka_outbound_published_total",
            "Messages acknowledged by the broker",
        )?;
        let outbound_failed = topic_counter(
            "kafka_outbound_failed_total",
            "Messages the broker failed to accept",
        )?;
        let outbound_dropped = IntCounter::with_opts(
            Opts::new(
                "kafka_outbound_dropped_total",
                "Messages rejected because too many sends were in flight",
            )
            .const_label("connection", connection_id.to_string()),
        )?;

        for metric in [
            Box::new(inbound_consumed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(inbound_failed.clone()),
            Box::new(inbound_expired.clone()),
            Box::new(inbound_dropped.clone()),
            Box::new(outbound_published.clone()),
            Box::new(outbound_failed.clone()),
            Box::new(outbound_dropped.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register connectivity metric: {}", e);
            }
        }

        Ok(Self {
            inbound_consumed,
            inbound_failed,
            inbound_expired,
            inbound_dropped,
            outbound_published,
            outbound_failed,
            outbound_dropped,
        })
    }
}

impl InboundMonitor for ConnectivityMetrics {
    fn transformed(
        &self,
        record: &KafkaRecord,
        result: &TransformationResult,
    ) -> Result<(), MonitorError> {
        let counter = if result.is_success() {
            &self.inbound_consumed
        } else {
            &self.inbound_failed
        };
        counter.get_metric_with_label_values(&[record.topic.as_str()])?.inc();
        Ok(())
    }

    fn expired(&self, topic: &str) {
        self.inbound_expired.with_label_values(&[topic]).inc();
    }

    fn dropped(&self, topic: &str) {
        self.inbound_dropped.with_label_values(&[topic]).inc();
    }
}

impl OutboundMonitor for ConnectivityMetrics {
    fn published(&self, topic: &str) {
        self.outbound_published.with_label_values(&[topic]).inc();
    }

    fn failed(&self, topic: &str) {
        self.outbound_failed.with_label_values(&[topic]).inc();
    }

    fn dropped(&self) {
        self.outbound_dropped.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{TransformationError, TransformationErrorKind};
    use crate::message::ExternalMessage;

    #[test]
    fn test_inbound_counters() {
        let registry = Registry::new();
        let metrics = ConnectivityMetrics::new("conn-1", &registry).unwrap();
        let record = KafkaRecord::new("events", 0, 1);

        metrics
            .transformed(
                &record,
                &TransformationResult::successful(ExternalMessage::default()),
            )
            .unwrap();
        metrics
            .transformed(
                &record,
                &TransformationResult::failed(TransformationError::new(
                    TransformationErrorKind::UnresolvedPlaceholder,
                    "unresolved",
                    Default::default(),
                )),
            )
            .unwrap();
        InboundMonitor::dropped(&metrics, "events");

        assert_eq!(metrics.inbound_consumed.with_label_values(&["events"]).get(), 1);
        assert_eq!(metrics.inbound_failed.with_label_values(&["events"]).get(), 1);
        assert_eq!(metrics.inbound_dropped.with_label_values(&["events"]).get(), 1);
    }

    #[test]
    fn test_duplicate_registration_is_not_fatal() {
        let registry = Registry::new();
        let first = ConnectivityMetrics::new("conn-1", &registry).unwrap();
        let second = ConnectivityMetrics::new("conn-1", &registry).unwrap();

        OutboundMonitor::dropped(&second);
        assert_eq!(second.outbound_dropped.get(), 1);
        assert_eq!(first.outbound_dropped.get(), 0);
    }
}
