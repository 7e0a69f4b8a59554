//! Turns consumed broker records into envelopes for the downstream sink.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::consumer::ConsumerData;
use crate::delivery::{TransformationError, TransformationErrorKind, TransformationResult};
use crate::enforcement::{EnforcementError, EnforcementFilter};
use crate::headers::{self, MessageHeaders};
use crate::message::{ExternalMessage, KafkaRecord};
use crate::metrics::InboundMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Charset {
    Utf8,
    UsAscii,
    Latin1,
    Utf16Be,
    Utf16Le,
}

impl Charset {
    /// Charset named by a `content-type` header, UTF-8 when absent or unknown
    fn from_content_type(content_type: Option<&str>) -> Self {
        let charset = content_type
            .and_then(|value| value.parse::<mime::Mime>().ok())
            .and_then(|parsed| {
                parsed
                    .get_param(mime::CHARSET)
                    .map(|name| name.as_str().to_ascii_lowercase())
            });

        match charset.as_deref() {
            Some("us-ascii") | Some("ascii") => Charset::UsAscii,
            Some("iso-8859-1") | Some("latin1") => Charset::Latin1,
            Some("utf-16be") => Charset::Utf16Be,
            Some("utf-16le") => Charset::Utf16Le,
            _ => Charset::Utf8,
        }
    }

    fn decode(self, bytes: &[u8]) -> String {
        match self {
            Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Charset::UsAscii => bytes
                .iter()
                .map(|&b| {
                    if b.is_ascii() {
                        b as char
                    } else {
                        char::REPLACEMENT_CHARACTER
                    }
                })
                .collect(),
            Charset::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Charset::Utf16Be => decode_utf16(bytes, u16::from_be_bytes),
            Charset::Utf16Le => decode_utf16(bytes, u16::from_le_bytes),
        }
    }
}

fn decode_utf16(bytes: &[u8], to_unit: fn([u8; 2]) -> u16) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| to_unit([pair[0], pair[1]]))
        .collect();
    let mut text = String::from_utf16_lossy(&units);
    if bytes.len() % 2 != 0 {
        text.push(char::REPLACEMENT_CHARACTER);
    }
    text
}

/// Converts [`KafkaRecord`]s of one consumer into [`TransformationResult`]s.
#[derive(Clone)]
pub struct KafkaMessageTransformer {
    consumer_data: Arc<ConsumerData>,
    enforcement: Option<Arc<dyn EnforcementFilter>>,
    monitor: Arc<dyn InboundMonitor>,
}

impl KafkaMessageTransformer {
    pub fn new(
        consumer_data: Arc<ConsumerData>,
        enforcement: Option<Arc<dyn EnforcementFilter>>,
        monitor: Arc<dyn InboundMonitor>,
    ) -> Self {
        Self {
            consumer_data,
            enforcement,
            monitor,
        }
    }

    pub fn consumer_data(&self) -> &ConsumerData {
        &self.consumer_data
    }

    pub(crate) fn monitor(&self) -> &dyn InboundMonitor {
        self.monitor.as_ref()
    }

    /// Transform one record.
    ///
    /// Returns `None` when the monitor could not be notified. Such records must be
    /// dropped without acknowledgement and without committing their offset.
    pub fn transform(&self, record: &KafkaRecord) -> Option<TransformationResult> {
        let mut headers = record.string_headers();
        let correlation_id = correlation_id(&headers);
        headers
            .entry(headers::CORRELATION_ID.to_string())
            .or_insert(correlation_id);

        let result = match self.enforce(record, &headers) {
            Ok(()) => TransformationResult::successful(self.envelope(record, headers)),
            Err(error) => {
                debug!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %error,
                    "Record failed enforcement"
                );
                TransformationResult::failed(error)
            }
        };

        if let Err(e) = self.monitor.transformed(record, &result) {
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Failed to report transformation, dropping record"
            );
            return None;
        }

        Some(result)
    }

    fn enforce(
        &self,
        record: &KafkaRecord,
        headers: &MessageHeaders,
    ) -> Result<(), TransformationError> {
        let Some(enforcement) = &self.enforcement else {
            return Ok(());
        };

        enforcement
            .evaluate(&record.topic, headers)
            .map_err(|error| {
                let kind = match error {
                    EnforcementError::UnresolvedPlaceholder(_) => {
                        TransformationErrorKind::UnresolvedPlaceholder
                    }
                    EnforcementError::Mismatch { .. } => {
                        TransformationErrorKind::EnforcementMismatch
                    }
                };
                TransformationError::new(kind, error.to_string(), headers.clone())
            })
    }

    fn envelope(&self, record: &KafkaRecord, mut headers: MessageHeaders) -> ExternalMessage {
        let data = &self.consumer_data;

        for (target, source) in &data.header_mapping {
            if let Some(value) = headers.get(source).cloned() {
                headers.insert(target.clone(), value);
            }
        }

        headers.insert(headers::KAFKA_TOPIC.to_string(), record.topic.clone());
        if let Some(key) = record.key_string() {
            headers.insert(headers::KAFKA_KEY.to_string(), key);
        }
        if let Some(timestamp) = record.timestamp {
            headers.insert(headers::KAFKA_TIMESTAMP.to_string(), timestamp.to_string());
        }

        let charset =
            Charset::from_content_type(headers.get(headers::CONTENT_TYPE).map(String::as_str));

        let mut message = ExternalMessage::new(headers);
        if let Some(payload) = &record.payload {
            message.text_payload = Some(charset.decode(payload));
            message.bytes_payload = Some(payload.clone());
        }
        message.source_address = Some(data.address.clone());
        message.authorization_context = data.authorization_context.clone();
        message.reply_target = data.reply_target.clone();
        message
    }
}

/// `correlation-id` header, else `device_id`, else a fresh id
fn correlation_id(headers: &MessageHeaders) -> String {
    headers
        .get(headers::CORRELATION_ID)
        .or_else(|| headers.get(headers::DEVICE_ID))
        .cloned()
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
